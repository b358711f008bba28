use log::Level;
use std::fmt::Arguments;

/// Sink for the diagnostics produced while inspecting and patching binaries.
///
/// The orchestrator never fails because of a patch problem, so this is the only
/// place where such problems become visible.
pub trait Reporter: Send + Sync {
    fn report(&self, level: Level, args: Arguments<'_>);
}

/// Forward diagnostics to the `log` facade.
#[derive(Debug, Default, Clone, Copy)]
pub struct LogReporter;

impl Reporter for LogReporter {
    fn report(&self, level: Level, args: Arguments<'_>) {
        log::log!(target: "binpatch", level, "{}", args);
    }
}

/// Discard every diagnostic.
#[derive(Debug, Default, Clone, Copy)]
pub struct Silent;

impl Reporter for Silent {
    fn report(&self, _level: Level, _args: Arguments<'_>) {}
}
