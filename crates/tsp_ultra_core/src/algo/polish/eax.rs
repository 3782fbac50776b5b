//! Edge assembly crossover over a small population of tours.
//!
//! The union of two parents' edges is split into AB-cycles, cycles whose
//! edges alternate between parent A and parent B. Applying a cycle to A
//! removes its A edges and inserts its B edges; the resulting sub-tours are
//! bridged back together through the nearest candidate edges.

use rand::{Rng, seq::index::sample};

use crate::{
    algo::kernel::{
        lin_kernighan::{LkSchedule, LkVariant, lin_kernighan},
        or_opt::or_opt,
        perturb::{double_bridge, random_segment_reversal},
    },
    budget::Deadline,
    geometry::TourGeometry,
    node::Point,
    oracle::knn::KnnGraph,
    tour::is_permutation,
};

const SENTINEL: usize = usize::MAX;
/// Intermediate degree can reach 4 while a cycle is half applied.
const ADJ_CAPACITY: usize = 4;
/// Highest-gain cycles tried per crossover.
const TOP_CYCLES: usize = 5;
/// Bridge search falls back to all pairs among this many cities.
const BRUTE_FORCE_LIMIT: usize = 500;
const MIN_CYCLE_EDGES: usize = 4;

#[derive(Clone, Copy, Debug)]
pub(crate) struct EaxSettings {
    pub(crate) pop_size: usize,
    pub(crate) generations: usize,
    pub(crate) lk_iters: usize,
    pub(crate) lk_no_improve: usize,
    pub(crate) variant: LkVariant,
    pub(crate) tournament: usize,
    /// Non-improving generations before a diversity injection.
    pub(crate) stagnation_limit: usize,
    /// Consecutive failed crossovers before a diversity injection.
    pub(crate) failure_limit: usize,
}

impl EaxSettings {
    pub(crate) const fn new(variant: LkVariant) -> Self {
        Self {
            pop_size: 15,
            generations: 300,
            lk_iters: 25,
            lk_no_improve: 2,
            variant,
            tournament: 3,
            stagnation_limit: 5,
            failure_limit: 10,
        }
    }
}

#[derive(Clone, Debug, Default)]
pub(crate) struct EaxOutcome {
    pub(crate) tour: Vec<usize>,
    pub(crate) length: f64,
    pub(crate) generations: usize,
    pub(crate) children: usize,
    pub(crate) injections: usize,
}

/// One edge of an AB-cycle, `from_a` naming the parent it belongs to.
#[derive(Clone, Copy, Debug, PartialEq)]
struct CycleEdge {
    u: usize,
    v: usize,
    from_a: bool,
}

type Links = Vec<[usize; 2]>;

fn tour_links(tour: &[usize]) -> Links {
    let n = tour.len();
    let mut links = vec![[SENTINEL; 2]; n];
    for i in 0..n {
        links[tour[i]] = [tour[(i + n - 1) % n], tour[(i + 1) % n]];
    }
    links
}

fn has_link(links: &Links, u: usize, v: usize) -> bool {
    links[u][0] == v || links[u][1] == v
}

/// Splits the symmetric difference of `a` and `b` into alternating cycles.
fn ab_cycles(a: &Links, b: &Links) -> Vec<Vec<CycleEdge>> {
    let n = a.len();
    let mut used_a = vec![[false; 2]; n];
    let mut used_b = vec![[false; 2]; n];
    let mut cycles = Vec::new();

    for start in 0..n {
        for start_slot in 0..2 {
            let first = a[start][start_slot];
            if used_a[start][start_slot] || has_link(b, start, first) {
                continue;
            }
            if let Some(cycle) = trace_cycle(a, b, &mut used_a, &mut used_b, start, start_slot) {
                cycles.push(cycle);
            }
        }
    }
    cycles
}

fn mark(links: &Links, used: &mut [[bool; 2]], u: usize, v: usize) {
    for (x, y) in [(u, v), (v, u)] {
        if let Some(slot) = links[x].iter().position(|&w| w == y) {
            used[x][slot] = true;
        }
    }
}

fn trace_cycle(
    a: &Links,
    b: &Links,
    used_a: &mut [[bool; 2]],
    used_b: &mut [[bool; 2]],
    start: usize,
    start_slot: usize,
) -> Option<Vec<CycleEdge>> {
    let n = a.len();
    let mut edges = Vec::new();
    let mut current = start;
    let mut next = a[start][start_slot];
    let mut from_a = true;

    for _ in 0..2 * n {
        edges.push(CycleEdge {
            u: current,
            v: next,
            from_a,
        });
        if from_a {
            mark(a, used_a, current, next);
        } else {
            mark(b, used_b, current, next);
        }
        current = next;
        from_a = !from_a;

        let (links, other, used) = if from_a {
            (a, b, &*used_a)
        } else {
            (b, a, &*used_b)
        };
        let step = (0..2).map(|slot| (slot, links[current][slot])).find(|&(slot, w)| {
            !used[current][slot] && w != SENTINEL && !has_link(other, current, w)
        });
        let (_, w) = step?;
        if w == start && !from_a && edges.len() >= MIN_CYCLE_EDGES - 1 {
            edges.push(CycleEdge {
                u: current,
                v: start,
                from_a,
            });
            mark(b, used_b, current, start);
            return Some(edges);
        }
        next = w;
    }
    None
}

fn cycle_gain(points: &[Point], cycle: &[CycleEdge]) -> f64 {
    cycle
        .iter()
        .map(|e| {
            let d = points[e.u].dist(points[e.v]);
            if e.from_a { d } else { -d }
        })
        .sum()
}

/// Fixed-capacity adjacency used while a cycle is applied.
struct Graph {
    adj: Vec<[usize; ADJ_CAPACITY]>,
    deg: Vec<usize>,
}

impl Graph {
    fn from_links(links: &Links) -> Self {
        let adj = links
            .iter()
            .map(|&[p, q]| [p, q, SENTINEL, SENTINEL])
            .collect();
        Self {
            adj,
            deg: vec![2; links.len()],
        }
    }

    fn remove_half(&mut self, u: usize, v: usize) -> bool {
        let d = self.deg[u];
        let Some(k) = self.adj[u][..d].iter().position(|&w| w == v) else {
            return false;
        };
        self.adj[u].copy_within(k + 1..d, k);
        self.adj[u][d - 1] = SENTINEL;
        self.deg[u] -= 1;
        true
    }

    fn remove(&mut self, u: usize, v: usize) -> bool {
        self.remove_half(u, v) && self.remove_half(v, u)
    }

    fn add(&mut self, u: usize, v: usize) -> bool {
        if self.deg[u] >= ADJ_CAPACITY || self.deg[v] >= ADJ_CAPACITY {
            return false;
        }
        self.adj[u][self.deg[u]] = v;
        self.deg[u] += 1;
        self.adj[v][self.deg[v]] = u;
        self.deg[v] += 1;
        true
    }

    fn all_degree_two(&self) -> bool {
        self.deg.iter().all(|&d| d == 2)
    }

    /// Component id per city and the component count.
    fn components(&self) -> (Vec<usize>, usize) {
        let n = self.deg.len();
        let mut comp = vec![SENTINEL; n];
        let mut count = 0;
        let mut stack = Vec::new();
        for s in 0..n {
            if comp[s] != SENTINEL {
                continue;
            }
            comp[s] = count;
            stack.push(s);
            while let Some(c) = stack.pop() {
                for &w in &self.adj[c][..self.deg[c]] {
                    if comp[w] == SENTINEL {
                        comp[w] = count;
                        stack.push(w);
                    }
                }
            }
            count += 1;
        }
        (comp, count)
    }

    fn walk(&self) -> Option<Vec<usize>> {
        let n = self.deg.len();
        let mut tour = Vec::with_capacity(n);
        let mut prev = SENTINEL;
        let mut current = 0;
        for _ in 0..n {
            tour.push(current);
            let [p, q, ..] = self.adj[current];
            let next = if p != prev { p } else { q };
            if next == SENTINEL {
                return None;
            }
            prev = current;
            current = next;
        }
        (current == 0 && is_permutation(&tour, n)).then_some(tour)
    }
}

/// Applies `cycle` to parent A and reconnects the resulting sub-tours.
fn apply_cycle(points: &[Point], knn: &KnnGraph, a: &Links, cycle: &[CycleEdge]) -> Option<Vec<usize>> {
    let mut graph = Graph::from_links(a);
    for e in cycle.iter().filter(|e| e.from_a) {
        if !graph.remove(e.u, e.v) {
            return None;
        }
    }
    for e in cycle.iter().filter(|e| !e.from_a) {
        if !graph.add(e.u, e.v) {
            return None;
        }
    }
    if !graph.all_degree_two() {
        return None;
    }

    let (_, initial) = graph.components();
    for _ in 0..2 * initial {
        let (comp, count) = graph.components();
        if count <= 1 {
            break;
        }
        let (u, v) = nearest_bridge(points, knn, &comp)?;
        let [u_next, ..] = graph.adj[u];
        let [v_next, ..] = graph.adj[v];
        if !(graph.remove(u, u_next) && graph.remove(v, v_next)) {
            return None;
        }
        if !(graph.add(u, v) && graph.add(u_next, v_next)) {
            return None;
        }
    }
    graph.walk()
}

/// Shortest candidate edge between two components, falling back to all
/// pairs among the first cities.
fn nearest_bridge(points: &[Point], knn: &KnnGraph, comp: &[usize]) -> Option<(usize, usize)> {
    let n = comp.len();
    let candidates = (0..n).flat_map(|u| knn.neighbors(u).iter().map(move |&v| (u, v)));
    shortest_cross_pair(points, comp, candidates).or_else(|| {
        let limit = n.min(BRUTE_FORCE_LIMIT);
        let pairs = (0..limit).flat_map(|u| (u + 1..limit).map(move |v| (u, v)));
        shortest_cross_pair(points, comp, pairs)
    })
}

fn shortest_cross_pair(
    points: &[Point],
    comp: &[usize],
    pairs: impl Iterator<Item = (usize, usize)>,
) -> Option<(usize, usize)> {
    pairs
        .filter(|&(u, v)| comp[u] != comp[v])
        .min_by(|&(a, b), &(c, d)| {
            points[a]
                .dist_sq(points[b])
                .total_cmp(&points[c].dist_sq(points[d]))
        })
}

/// One crossover child of `a` and `b`, or `None` when no cycle yields a
/// valid tour.
pub(crate) fn eax_crossover(points: &[Point], knn: &KnnGraph, a: &[usize], b: &[usize]) -> Option<Vec<usize>> {
    let n = points.len();
    if a.len() != n || b.len() != n || n < MIN_CYCLE_EDGES {
        return None;
    }
    let links_a = tour_links(a);
    let links_b = tour_links(b);
    let mut cycles: Vec<(f64, Vec<CycleEdge>)> = ab_cycles(&links_a, &links_b)
        .into_iter()
        .filter(|c| c.len() >= MIN_CYCLE_EDGES)
        .map(|c| (cycle_gain(points, &c), c))
        .collect();
    cycles.sort_by(|x, y| y.0.total_cmp(&x.0));
    cycles
        .iter()
        .take(TOP_CYCLES)
        .find_map(|(_, cycle)| apply_cycle(points, knn, &links_a, cycle))
}

/// Evolves `initial` with tournament selection and worst replacement.
/// Returns the shortest tour seen, never longer than the best initial tour.
#[tsp_ultra_derive::timer("eax")]
pub(crate) fn evolve<R: Rng + ?Sized>(
    points: &[Point],
    knn: &KnnGraph,
    initial: Vec<Vec<usize>>,
    settings: EaxSettings,
    deadline: &Deadline,
    rng: &mut R,
) -> Option<EaxOutcome> {
    let mut population: Vec<(f64, Vec<usize>)> = initial
        .into_iter()
        .take(settings.pop_size)
        .map(|t| (TourGeometry::tour_length(points, &t), t))
        .collect();
    let best_start = best_index(&population)?;
    let schedule = LkSchedule::new(settings.variant, settings.lk_iters, settings.lk_no_improve);
    let mut outcome = EaxOutcome {
        length: population[best_start].0,
        tour: population[best_start].1.clone(),
        ..EaxOutcome::default()
    };

    while population.len() < settings.pop_size && !deadline.expired() {
        let fresh = perturbed(points, knn, &outcome.tour, false, schedule, deadline, rng);
        population.push(fresh);
    }
    if population.len() < 2 {
        return Some(outcome);
    }

    let mut stagnant = 0;
    let mut failed = 0;
    for _ in 0..settings.generations {
        if deadline.expired() {
            break;
        }
        outcome.generations += 1;
        let (ia, ib) = tournament_pair(&population, settings.tournament, rng);
        let Some(mut child) = eax_crossover(points, knn, &population[ia].1, &population[ib].1) else {
            failed += 1;
            if failed > settings.failure_limit {
                // Parents too alike to recombine: reverse a segment as well.
                inject(points, knn, &mut population, &outcome.tour, true, schedule, deadline, rng);
                outcome.injections += 1;
                failed = 0;
            }
            continue;
        };
        failed = 0;
        outcome.children += 1;
        lin_kernighan(points, &mut child, knn, schedule, deadline);
        or_opt(points, &mut child, knn, 1, deadline);
        let len = TourGeometry::tour_length(points, &child);

        let worst = worst_index(&population);
        if len < population[worst].0 {
            if len < outcome.length {
                outcome.length = len;
                outcome.tour.clone_from(&child);
                log::debug!("eax: generation={} best={len:.3}", outcome.generations);
            }
            population[worst] = (len, child);
            stagnant = 0;
        } else {
            stagnant += 1;
        }
        if stagnant >= settings.stagnation_limit {
            inject(points, knn, &mut population, &outcome.tour, false, schedule, deadline, rng);
            outcome.injections += 1;
            stagnant = 0;
        }
    }

    log::debug!(
        "eax: done population={} generations={} children={} injections={} best={:.3}",
        population.len(),
        outcome.generations,
        outcome.children,
        outcome.injections,
        outcome.length
    );
    Some(outcome)
}

fn perturbed<R: Rng + ?Sized>(
    points: &[Point],
    knn: &KnnGraph,
    base: &[usize],
    reverse: bool,
    schedule: LkSchedule,
    deadline: &Deadline,
    rng: &mut R,
) -> (f64, Vec<usize>) {
    let mut tour = base.to_vec();
    double_bridge(&mut tour, rng);
    if reverse {
        random_segment_reversal(&mut tour, rng);
    }
    lin_kernighan(points, &mut tour, knn, schedule, deadline);
    (TourGeometry::tour_length(points, &tour), tour)
}

/// Replaces the worst member with a kicked and repaired copy of the best.
#[allow(clippy::too_many_arguments)]
fn inject<R: Rng + ?Sized>(
    points: &[Point],
    knn: &KnnGraph,
    population: &mut [(f64, Vec<usize>)],
    best: &[usize],
    reverse: bool,
    schedule: LkSchedule,
    deadline: &Deadline,
    rng: &mut R,
) {
    let worst = worst_index(population);
    population[worst] = perturbed(points, knn, best, reverse, schedule, deadline, rng);
}

fn best_index(population: &[(f64, Vec<usize>)]) -> Option<usize> {
    population
        .iter()
        .enumerate()
        .min_by(|x, y| x.1.0.total_cmp(&y.1.0))
        .map(|(i, _)| i)
}

fn worst_index(population: &[(f64, Vec<usize>)]) -> usize {
    population
        .iter()
        .enumerate()
        .max_by(|x, y| x.1.0.total_cmp(&y.1.0))
        .map_or(0, |(i, _)| i)
}

/// Two distinct parents, each the shortest of `size` random members.
fn tournament_pair<R: Rng + ?Sized>(population: &[(f64, Vec<usize>)], size: usize, rng: &mut R) -> (usize, usize) {
    let n = population.len();
    let pick = |rng: &mut R| {
        sample(rng, n, size.clamp(1, n))
            .into_iter()
            .min_by(|&x, &y| population[x].0.total_cmp(&population[y].0))
            .unwrap_or(0)
    };
    let a = pick(rng);
    for _ in 0..10 {
        let b = pick(rng);
        if b != a {
            return (a, b);
        }
    }
    (a, (a + 1) % n)
}

#[cfg(test)]
mod tests {
    use rand::{SeedableRng, rngs::StdRng};

    use super::*;
    use crate::algo::kernel::{
        test_support::{assert_valid, random_points, shuffled_tour},
        two_opt::two_opt,
    };

    fn local_optimum(points: &[Point], knn: &KnnGraph, seed: u64) -> Vec<usize> {
        let mut tour = shuffled_tour(points.len(), seed);
        two_opt(points, &mut tour, knn, 50, 5, &Deadline::after_secs(5.0));
        tour
    }

    #[test]
    fn ab_cycles_alternate_and_cover_the_difference() {
        let points = random_points(60, 91);
        let knn = KnnGraph::build(&points, 8);
        let a = local_optimum(&points, &knn, 92);
        let b = local_optimum(&points, &knn, 93);
        let la = tour_links(&a);
        let lb = tour_links(&b);
        let cycles = ab_cycles(&la, &lb);
        assert!(!cycles.is_empty());
        for cycle in &cycles {
            assert_eq!(cycle.len() % 2, 0);
            assert_eq!(cycle[0].u, cycle[cycle.len() - 1].v);
            for pair in cycle.windows(2) {
                assert_eq!(pair[0].v, pair[1].u);
                assert_ne!(pair[0].from_a, pair[1].from_a);
            }
            for e in cycle {
                let (own, other) = if e.from_a { (&la, &lb) } else { (&lb, &la) };
                assert!(has_link(own, e.u, e.v));
                assert!(!has_link(other, e.u, e.v));
            }
        }
    }

    #[test]
    fn identical_parents_have_no_child() {
        let points = random_points(30, 94);
        let knn = KnnGraph::build(&points, 6);
        let a = local_optimum(&points, &knn, 95);
        assert!(eax_crossover(&points, &knn, &a, &a).is_none());
    }

    #[test]
    fn children_are_permutations() {
        let points = random_points(200, 96);
        let knn = KnnGraph::build(&points, 8);
        let mut produced = 0;
        for seed in 0..6 {
            let a = local_optimum(&points, &knn, 100 + seed);
            let b = local_optimum(&points, &knn, 200 + seed);
            if let Some(child) = eax_crossover(&points, &knn, &a, &b) {
                assert_valid(&child, 200);
                produced += 1;
            }
        }
        assert!(produced > 0);
    }

    #[test]
    fn two_squares_cycle_gives_the_better_parent_edges() {
        // A visits the unit square crosswise; B walks its perimeter.
        let points = vec![
            Point::new(0.0, 0.0),
            Point::new(1.0, 0.0),
            Point::new(1.0, 1.0),
            Point::new(0.0, 1.0),
        ];
        let knn = KnnGraph::build(&points, 3);
        let a = vec![0, 2, 1, 3];
        let b = vec![0, 1, 2, 3];
        let child = eax_crossover(&points, &knn, &a, &b).expect("child");
        assert_valid(&child, 4);
        assert!((TourGeometry::tour_length(&points, &child) - 4.0).abs() < 1e-12);
    }

    #[test]
    fn evolve_never_returns_worse_than_the_best_parent() {
        let points = random_points(150, 97);
        let knn = KnnGraph::build(&points, 8);
        let initial: Vec<Vec<usize>> = (0..4).map(|s| local_optimum(&points, &knn, 300 + s)).collect();
        let best_initial = initial
            .iter()
            .map(|t| TourGeometry::tour_length(&points, t))
            .fold(f64::INFINITY, f64::min);
        let mut settings = EaxSettings::new(LkVariant::DontLook);
        settings.pop_size = 6;
        settings.generations = 40;
        let mut rng = StdRng::seed_from_u64(98);
        let outcome = evolve(&points, &knn, initial, settings, &Deadline::after_secs(10.0), &mut rng)
            .expect("population");
        assert_valid(&outcome.tour, 150);
        assert!(outcome.length <= best_initial + 1e-9);
        assert!((TourGeometry::tour_length(&points, &outcome.tour) - outcome.length).abs() < 1e-6);
        assert!(outcome.generations > 0);
    }

    #[test]
    fn tournament_picks_distinct_parents() {
        let population: Vec<(f64, Vec<usize>)> = (0..5).map(|i| (i as f64, Vec::new())).collect();
        let mut rng = StdRng::seed_from_u64(99);
        for _ in 0..50 {
            let (a, b) = tournament_pair(&population, 3, &mut rng);
            assert_ne!(a, b);
        }
        let points = random_points(10, 1);
        assert!(evolve(
            &points,
            &KnnGraph::build(&points, 3),
            Vec::new(),
            EaxSettings::new(LkVariant::DontLook),
            &Deadline::after_secs(1.0),
            &mut rng
        )
        .is_none());
    }
}
