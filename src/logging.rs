//! Logging setup for the demo binaries and integration tests.
//!
//! Library modules never print directly; they emit through the `log`
//! facade (`log::{info,warn,error,debug}`), exactly as the teacher's
//! `src-tauri/src/runtime/lan/*.rs` does via its `RuntimeEvent::Log` events. This module
//! just wires a terminal sink at the process edge.

use simplelog::{ColorChoice, Config, LevelFilter, TermLogger, TerminalMode};

/// Install a coloured terminal logger at the given level. Safe to call more
/// than once; subsequent calls are ignored (mirrors `CombinedLogger::init`
/// in the teacher's `log.rs`, which also tolerates repeat setup during
/// development reloads).
pub fn init_logging(level: LevelFilter) {
    let _ = TermLogger::init(
        level,
        Config::default(),
        TerminalMode::Mixed,
        ColorChoice::Auto,
    );
}
