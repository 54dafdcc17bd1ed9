//! Non-dominated sorting and NSGA-II selection.
//!
//! Everything here works on *minimisation keys*: one vector per individual
//! in which a smaller value is better in every coordinate. The optimiser
//! derives keys from raw fitness with the objective weights, so maximised
//! objectives and failure sentinels need no special cases here.
//!
//! References:
//! - Deb, K., et al. "A Fast and Elitist Multiobjective Genetic Algorithm: NSGA-II" (2002)

use std::cmp::Ordering;

/// Whether `a` is no worse than `b` everywhere and strictly better somewhere.
pub fn dominates(a: &[f64], b: &[f64]) -> bool {
    let mut better = false;
    for (x, y) in a.iter().zip(b) {
        if x > y {
            return false;
        }
        if x < y {
            better = true;
        }
    }
    better
}

/// Fast non-dominated sort. Returns the Pareto rank of each entry (0 = not
/// dominated by anything).
pub fn non_dominated_sort(keys: &[Vec<f64>]) -> Vec<usize> {
    let n = keys.len();
    let mut rank = vec![usize::MAX; n];
    let mut domination_count: Vec<usize> = vec![0; n];
    let mut dominated_by: Vec<Vec<usize>> = vec![Vec::new(); n];

    for i in 0..n {
        for j in (i + 1)..n {
            if dominates(&keys[i], &keys[j]) {
                dominated_by[i].push(j);
                domination_count[j] += 1;
            } else if dominates(&keys[j], &keys[i]) {
                dominated_by[j].push(i);
                domination_count[i] += 1;
            }
        }
    }

    let mut current_front: Vec<usize> = Vec::new();
    for (i, &count) in domination_count.iter().enumerate() {
        if count == 0 {
            rank[i] = 0;
            current_front.push(i);
        }
    }

    let mut front_idx = 0;
    while !current_front.is_empty() {
        let mut next_front: Vec<usize> = Vec::new();
        for &i in &current_front {
            for &j in &dominated_by[i] {
                domination_count[j] -= 1;
                if domination_count[j] == 0 {
                    rank[j] = front_idx + 1;
                    next_front.push(j);
                }
            }
        }
        front_idx += 1;
        current_front = next_front;
    }
    rank
}

/// Group indices by rank, best front first, each front in index order.
pub fn fronts(ranks: &[usize]) -> Vec<Vec<usize>> {
    let max_rank = ranks.iter().copied().max().unwrap_or(0);
    let mut out: Vec<Vec<usize>> = vec![Vec::new(); if ranks.is_empty() { 0 } else { max_rank + 1 }];
    for (i, &r) in ranks.iter().enumerate() {
        out[r].push(i);
    }
    out
}

/// Crowding distance of each member of `front`, aligned with `front`.
/// Boundary members are infinitely far; objectives whose spread is not
/// finite (e.g. a failure sentinel in the front) contribute nothing.
pub fn crowding_distance(keys: &[Vec<f64>], front: &[usize]) -> Vec<f64> {
    let len = front.len();
    if len <= 2 {
        return vec![f64::INFINITY; len];
    }
    let mut distance = vec![0.0; len];
    let n_obj = keys[front[0]].len();
    let mut order: Vec<usize> = (0..len).collect();

    for m in 0..n_obj {
        order.sort_by(|&a, &b| {
            keys[front[a]][m]
                .partial_cmp(&keys[front[b]][m])
                .unwrap_or(Ordering::Equal)
        });

        let first = order[0];
        let last = order[len - 1];
        distance[first] = f64::INFINITY;
        distance[last] = f64::INFINITY;

        let f_min = keys[front[first]][m];
        let f_max = keys[front[last]][m];
        let spread = f_max - f_min;
        if !spread.is_finite() {
            continue;
        }
        let range = if spread.abs() > 1e-10 { spread } else { 1.0 };

        for i in 1..(len - 1) {
            let prev = keys[front[order[i - 1]]][m];
            let next = keys[front[order[i + 1]]][m];
            let gap = (next - prev) / range;
            if gap.is_finite() {
                distance[order[i]] += gap;
            }
        }
    }
    distance
}

/// Choose `k` indices: whole fronts while they fit, then the least crowded
/// members of the first front that does not. Ties keep index order.
pub fn select_nsga2(keys: &[Vec<f64>], k: usize) -> Vec<usize> {
    let ranks = non_dominated_sort(keys);
    let mut chosen = Vec::with_capacity(k);
    for front in fronts(&ranks) {
        let room = k - chosen.len();
        if room == 0 {
            break;
        }
        if front.len() <= room {
            chosen.extend(front);
            continue;
        }
        let distance = crowding_distance(keys, &front);
        let mut order: Vec<usize> = (0..front.len()).collect();
        order.sort_by(|&a, &b| {
            distance[b]
                .partial_cmp(&distance[a])
                .unwrap_or(Ordering::Equal)
        });
        chosen.extend(order.into_iter().take(room).map(|i| front[i]));
        break;
    }
    chosen
}

/// Binary NSGA-II tournament: the second aspirant wins only if it dominates
/// the first.
pub fn tournament(keys: &[Vec<f64>], a: usize, b: usize) -> usize {
    if dominates(&keys[b], &keys[a]) {
        b
    } else {
        a
    }
}

/// The `k` best entries on the first coordinate, ties in index order.
pub fn select_best(keys: &[Vec<f64>], k: usize) -> Vec<usize> {
    let mut order: Vec<usize> = (0..keys.len()).collect();
    order.sort_by(|&a, &b| {
        keys[a][0]
            .partial_cmp(&keys[b][0])
            .unwrap_or(Ordering::Equal)
    });
    order.truncate(k);
    order
}

/// Indices of the rank-0 entries, in index order.
pub fn pareto_front(keys: &[Vec<f64>]) -> Vec<usize> {
    non_dominated_sort(keys)
        .into_iter()
        .enumerate()
        .filter(|&(_, r)| r == 0)
        .map(|(i, _)| i)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_dominance() {
        assert!(dominates(&[1.0, 2.0], &[2.0, 3.0]));
        assert!(!dominates(&[2.0, 3.0], &[1.0, 2.0]));
        assert!(!dominates(&[1.0, 2.0], &[1.0, 2.0]));
        assert!(!dominates(&[1.0, 3.0], &[2.0, 2.0]));
        assert!(dominates(&[1.0, 1.0], &[f64::INFINITY, f64::INFINITY]));
    }

    #[test]
    fn test_sort_assigns_fronts() {
        let keys = vec![
            vec![1.0, 9.0],
            vec![2.0, 2.0],
            vec![5.0, 1.0],
            vec![3.0, 3.0],
            vec![6.0, 6.0],
        ];
        let ranks = non_dominated_sort(&keys);
        assert_eq!(ranks, vec![0, 0, 0, 1, 2]);
        assert_eq!(fronts(&ranks), vec![vec![0, 1, 2], vec![3], vec![4]]);
        assert_eq!(pareto_front(&keys), vec![0, 1, 2]);
    }

    #[test]
    fn test_crowding_boundaries_infinite() {
        let keys = vec![vec![0.0, 4.0], vec![1.0, 3.0], vec![3.0, 1.0], vec![4.0, 0.0]];
        let d = crowding_distance(&keys, &[0, 1, 2, 3]);
        assert!(d[0].is_infinite() && d[3].is_infinite());
        assert!((d[1] - 1.5).abs() < 1e-12, "got {}", d[1]);
        assert!((d[2] - 1.5).abs() < 1e-12, "got {}", d[2]);
    }

    #[test]
    fn test_select_nsga2_prefers_front_then_spread() {
        let keys = vec![
            vec![0.0, 4.0],
            vec![1.0, 3.0],
            vec![1.1, 2.9],
            vec![4.0, 0.0],
            vec![5.0, 5.0],
        ];
        let chosen = select_nsga2(&keys, 3);
        assert_eq!(chosen.len(), 3);
        assert!(chosen.contains(&0) && chosen.contains(&3));
        assert!(!chosen.contains(&4));
    }

    #[test]
    fn test_select_best_is_stable() {
        let keys = vec![vec![2.0], vec![1.0], vec![2.0], vec![1.0]];
        assert_eq!(select_best(&keys, 3), vec![1, 3, 0]);
    }

    #[test]
    fn test_tournament() {
        let keys = vec![vec![1.0, 1.0], vec![0.5, 0.5], vec![0.0, 2.0]];
        assert_eq!(tournament(&keys, 0, 1), 1);
        assert_eq!(tournament(&keys, 1, 0), 1);
        assert_eq!(tournament(&keys, 0, 2), 0);
    }
}
