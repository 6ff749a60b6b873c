//! Shared state threaded through every engine call.

use crate::config::Config;
use crate::view::{self, View};

/// The run configuration paired with the UI it reports to. Owned by the
/// process and passed down explicitly; there are no globals.
pub struct RunContext {
    pub cfg: Config,
    pub view: Box<dyn View>,
}

impl RunContext {
    pub fn new(cfg: Config) -> RunContext {
        let view = view::new_view(&cfg.view, cfg.quiet, cfg.no_styling);
        RunContext { cfg, view }
    }
}
