use std::{
    fs,
    io::{self, Read, Write},
    path::Path,
};

use crate::{Error, Point, Result};

/// Reads `x,y` tokens from `path`, or from stdin when no path is given.
pub fn read_points(path: Option<&Path>) -> Result<Vec<Point>> {
    let raw = match path {
        Some(path) => fs::read_to_string(path).map_err(|e| {
            Error::invalid_input(format!("failed to read {}: {e}", path.display()))
        })?,
        None => {
            let mut raw = String::new();
            io::stdin().read_to_string(&mut raw)?;
            raw
        }
    };
    parse_points(&raw)
}

/// Writes one point index per line.
pub fn write_tour(path: Option<&Path>, tour: &[usize]) -> Result<()> {
    let mut out = String::with_capacity(tour.len() * 8);
    for &id in tour {
        out.push_str(&id.to_string());
        out.push('\n');
    }

    match path {
        Some(path) => {
            if let Some(parent) = path.parent()
                && !parent.as_os_str().is_empty()
            {
                fs::create_dir_all(parent)?;
            }
            fs::write(path, out)?;
        }
        None => {
            let mut stdout = io::stdout().lock();
            stdout.write_all(out.as_bytes())?;
            stdout.flush()?;
        }
    }
    Ok(())
}

pub(crate) fn parse_points(input: &str) -> Result<Vec<Point>> {
    let mut points = Vec::new();
    for (idx, tok) in input.split_whitespace().enumerate() {
        let mut it = tok.split(',');
        let x_s = it
            .next()
            .ok_or_else(|| Error::invalid_input(format!("Token {}: missing x", idx + 1)))?;
        let y_s = it
            .next()
            .ok_or_else(|| Error::invalid_input(format!("Token {}: missing y", idx + 1)))?;

        if it.next().is_some() {
            return Err(Error::invalid_input(format!(
                "Token {}: expected 'x,y' but got extra comma fields: {tok}",
                idx + 1
            )));
        }

        let x: f64 = x_s
            .parse()
            .map_err(|_| Error::invalid_input(format!("Token {}: invalid x: {x_s}", idx + 1)))?;
        let y: f64 = y_s
            .parse()
            .map_err(|_| Error::invalid_input(format!("Token {}: invalid y: {y_s}", idx + 1)))?;

        let point = Point::new(x, y);
        if !point.is_valid() {
            return Err(Error::invalid_input(format!(
                "Token {}: coordinates must be finite: {tok}",
                idx + 1
            )));
        }
        points.push(point);
    }

    if points.is_empty() {
        return Err(Error::invalid_input("No points provided."));
    }

    Ok(points)
}

#[cfg(test)]
mod tests {
    use super::parse_points;

    #[test]
    fn parse_points_accepts_whitespace_separated_pairs() {
        let points = parse_points("0,0 1.5,2\n-3,4e1\t").expect("parse points");
        assert_eq!(points.len(), 3);
        assert_eq!(points[1].x, 1.5);
        assert_eq!(points[2].y, 40.0);
    }

    #[test]
    fn parse_points_rejects_missing_y() {
        let err = parse_points("0,0 1").expect_err("missing y should fail");
        assert!(err.to_string().contains("Token 2: missing y"));
    }

    #[test]
    fn parse_points_rejects_extra_fields() {
        let err = parse_points("1,2,3").expect_err("extra field should fail");
        assert!(err.to_string().contains("extra comma fields"));
    }

    #[test]
    fn parse_points_rejects_non_finite_values() {
        let err = parse_points("NaN,1").expect_err("NaN should fail");
        assert!(err.to_string().contains("must be finite"));
    }

    #[test]
    fn parse_points_rejects_empty_input() {
        let err = parse_points("  \n ").expect_err("empty input should fail");
        assert!(err.to_string().contains("No points provided"));
    }
}
