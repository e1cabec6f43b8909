// Copyright 2026 Weft Contributors
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! The OS portability layer.
//!
//! Everything above this module may assume exactly five primitive groups:
//! thread creation, page-granularity virtual memory, the kernel-blocking
//! semaphore [`Sema`], monotonic time, and OS sleep. Keeping the contract this
//! narrow is what made the original system's research-kernel port feasible;
//! a new host needs to fill in this module and nothing else.

mod sema;

cfg_if::cfg_if! {
    if #[cfg(unix)] {
        mod unix;
        pub use unix::*;
    } else {
        compile_error!("unsupported host os");
    }
}

pub use sema::Sema;
