pub mod deterministic_rng;
