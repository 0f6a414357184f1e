//! Scripted [`Runner`] for unit tests.

use std::cell::RefCell;
use std::collections::BTreeSet;
use std::path::{Path, PathBuf};

use anyhow::Result;

use crate::process::{Cmd, CmdResult, Runner};

type Handler = Box<dyn Fn(&Cmd) -> CmdResult>;

/// Answers commands from per-program handlers and records every call.
///
/// Programs are matched by file name, so `/root/.acme.sh/acme.sh` is handled
/// by `on("acme.sh", ..)`. Unhandled programs succeed with empty output.
#[derive(Default)]
pub(crate) struct ScriptedRunner {
    handlers: Vec<(String, Handler)>,
    programs: BTreeSet<String>,
    calls: RefCell<Vec<String>>,
}

impl ScriptedRunner {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// Programs that `locate` should find on PATH.
    pub(crate) fn with_programs(mut self, names: &[&str]) -> Self {
        self.programs.extend(names.iter().map(|n| n.to_string()));
        self
    }

    pub(crate) fn on(
        mut self,
        program: &str,
        handler: impl Fn(&Cmd) -> CmdResult + 'static,
    ) -> Self {
        self.handlers.push((program.to_string(), Box::new(handler)));
        self
    }

    pub(crate) fn calls(&self) -> Vec<String> {
        self.calls.borrow().clone()
    }

    /// True if any recorded call contains `needle`.
    pub(crate) fn called(&self, needle: &str) -> bool {
        self.calls.borrow().iter().any(|c| c.contains(needle))
    }

    fn dispatch(&self, cmd: &Cmd) -> CmdResult {
        self.calls.borrow_mut().push(cmd.display());
        let name = Path::new(cmd.program())
            .file_name()
            .and_then(|n| n.to_str())
            .unwrap_or(cmd.program());
        self.handlers
            .iter()
            .find(|(program, _)| program == name)
            .map(|(_, handler)| handler(cmd))
            .unwrap_or_else(|| CmdResult::ok(""))
    }
}

impl Runner for ScriptedRunner {
    fn output(&self, cmd: &Cmd) -> Result<CmdResult> {
        Ok(self.dispatch(cmd))
    }

    fn attached(&self, cmd: &Cmd) -> Result<CmdResult> {
        let mut result = self.dispatch(cmd);
        result.stdout.clear();
        result.stderr.clear();
        Ok(result)
    }

    fn locate(&self, program: &str) -> Option<PathBuf> {
        self.programs
            .contains(program)
            .then(|| PathBuf::from("/usr/bin").join(program))
    }
}
