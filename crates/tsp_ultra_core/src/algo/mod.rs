pub(crate) mod decompose;
pub(crate) mod kernel;
pub(crate) mod leaf;
pub(crate) mod polish;
pub(crate) mod solver;
pub(crate) mod stitching;
pub(crate) mod vcycle;
pub(crate) mod window;
