use std::collections::HashSet;

const WORKER_NAMES: &[&str] = &[
    "nux", "slit", "rictus", "furiosa", "capable", "toast",
    "cheedo", "dag", "angharad", "dementus", "scrotus",
    "morsov", "ace", "valkyrie", "keeper", "glory",
    "corpus", "praetorian", "buzzard", "rockrider",
];

/// Pick a worker name not present in `taken`. Cycles the pool first,
/// then falls back to a nanoid-suffixed name so collisions are
/// impossible in practice.
pub fn pick_name(taken: &HashSet<String>) -> String {
    for base in WORKER_NAMES {
        if !taken.contains(*base) {
            return (*base).to_string();
        }
    }
    for base in WORKER_NAMES {
        for n in 2..100 {
            let candidate = format!("{base}-{n}");
            if !taken.contains(&candidate) {
                return candidate;
            }
        }
    }
    format!("worker-{}", nanoid::nanoid!(6))
}

/// Short unique suffix for temporary branches and the like.
pub fn short_id() -> String {
    nanoid::nanoid!(8)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn first_pick_is_pool_head() {
        assert_eq!(pick_name(&HashSet::new()), "nux");
    }

    #[test]
    fn skips_taken_names() {
        let taken: HashSet<String> = ["nux", "slit"].iter().map(|s| s.to_string()).collect();
        assert_eq!(pick_name(&taken), "rictus");
    }

    #[test]
    fn exhausted_pool_gets_suffix() {
        let taken: HashSet<String> = WORKER_NAMES.iter().map(|s| s.to_string()).collect();
        assert_eq!(pick_name(&taken), "nux-2");
    }

    #[test]
    fn short_ids_are_unique() {
        let a = short_id();
        let b = short_id();
        assert_ne!(a, b);
        assert_eq!(a.len(), 8);
    }
}
