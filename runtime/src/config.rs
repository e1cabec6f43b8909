// Copyright 2026 Weft Contributors
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! Environment knobs, parsed once before any task runs.

use std::sync::OnceLock;

#[derive(Debug, Clone)]
pub struct Config {
    /// Number of OS worker threads. `WEFT_WORKERS`.
    pub workers: usize,
    /// Collector trigger ratio in percent: the heap may grow by this fraction
    /// of the live set before the next collection. `WEFT_GC_PERCENT`.
    pub gc_percent: usize,
    /// Address space reserved per task stack. `WEFT_STACK_SIZE`.
    pub stack_size: usize,
    /// Address space reserved for the managed heap. `WEFT_ARENA_SIZE`.
    pub arena_size: usize,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            workers: std::thread::available_parallelism().map_or(2, |n| n.get()),
            gc_percent: 100,
            stack_size: 1 << 20,
            arena_size: 512 << 20,
        }
    }
}

static CONFIG: OnceLock<Config> = OnceLock::new();

pub fn get() -> &'static Config {
    CONFIG.get_or_init(Config::from_env)
}

impl Config {
    fn from_env() -> Self {
        let mut cfg = Config::default();

        if let Some(workers) = parse_env("WEFT_WORKERS") {
            if workers > 0 {
                cfg.workers = workers;
            }
        }
        if let Some(percent) = parse_env("WEFT_GC_PERCENT") {
            cfg.gc_percent = percent;
        }
        if let Some(stack) = parse_env("WEFT_STACK_SIZE") {
            // Anything below two pages cannot hold the guard page plus an
            // entry frame.
            cfg.stack_size = stack.max(4 * crate::sys::page_size());
        }
        if let Some(arena) = parse_env("WEFT_ARENA_SIZE") {
            cfg.arena_size = arena.max(8 << 20);
        }

        cfg
    }
}

fn parse_env(name: &str) -> Option<usize> {
    let raw = std::env::var(name).ok()?;
    match raw.parse::<usize>() {
        Ok(v) => Some(v),
        Err(_) => {
            tracing::warn!("ignoring malformed {name}={raw:?}");
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_sane() {
        let cfg = Config::default();
        assert!(cfg.workers >= 1);
        assert!(cfg.stack_size >= 64 * 1024);
        assert!(cfg.arena_size >= cfg.stack_size);
    }
}
