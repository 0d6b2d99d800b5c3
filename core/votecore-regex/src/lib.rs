//! A small, backtracking-free regex engine: a Thompson-construction
//! compiler and a Pike's-VM executor, `O(n * m)` with no catastrophic
//! backtracking. Matching is always whole-string — there is no implicit
//! substring search; wrap a pattern in `.*?PAT.*` yourself if that's what
//! you want (the same convention the route matcher in
//! `votecore_http::server` relies on).

mod class;
mod compile;
mod op;
mod vm;


pub use compile::CompileError;
pub use vm::Match;

use op::Op;

/// A compiled pattern: an instruction program plus the names of its capture
/// groups (index 0 is always the whole match and has no name).
pub struct Regex {
    instructions: Vec<Op>,
    groups: Vec<Option<String>>,
    source: String,
}

impl Regex {
    pub fn compile(pattern: &str) -> Result<Regex, CompileError> {
        compile::compile(pattern)
    }

    /// Match is infallible given a compiled regex; it either finds a
    /// whole-string match or it doesn't.
    pub fn matches(&self, input: &str) -> Option<Match> {
        vm::run(self, input.as_bytes())
    }

    pub fn matches_bytes(&self, input: &[u8]) -> Option<Match> {
        vm::run(self, input)
    }

    pub fn source(&self) -> &str {
        &self.source
    }

    pub fn group_count(&self) -> usize {
        self.groups.len()
    }

    pub fn group_name(&self, index: usize) -> Option<&str> {
        self.groups.get(index)?.as_deref()
    }
}

impl std::fmt::Debug for Regex {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Regex")
            .field("source", &self.source)
            .field("instructions", &self.instructions.len())
            .field("groups", &self.groups)
            .finish()
    }
}
