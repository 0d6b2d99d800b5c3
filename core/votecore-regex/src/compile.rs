//! Single-pass-ish recursive-descent compiler: builds NFA fragments with
//! dangling exits (a patch list), the standard Thompson construction, and
//! patches each fragment's exits into whatever follows it as it goes.
//!
//! Nesting caps at [`MAX_NESTED_CAPTURE_GROUPS`] and a bounded repeat like
//! `{m,n}` caps at [`MAX_BOUNDED_REPEAT`], mirroring the original compiler's
//! `MAX_NESTED_CAPTURE_GROUPS` and `REPEAT_LIMIT` guards against a
//! pathological route pattern blowing out the instruction count at compile
//! time.

use crate::class::CharClass;
use crate::op::Op;
use crate::Regex;
use std::fmt;

const MAX_NESTED_CAPTURE_GROUPS: usize = 10;
const MAX_BOUNDED_REPEAT: usize = 100;

#[derive(Debug, Clone)]
pub struct CompileError {
    pub pattern: String,
    pub index: usize,
    pub message: String,
}

impl fmt::Display for CompileError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "{}", self.message)?;
        writeln!(f, "/{}/", self.pattern)?;
        write!(f, " {}^", " ".repeat(self.index))
    }
}

impl std::error::Error for CompileError {}

/// A dangling exit of an in-progress fragment, waiting to be pointed at
/// whatever comes next.
#[derive(Clone, Copy)]
enum Patch {
    Jump(usize),
    SplitA(usize),
    SplitB(usize),
}

struct Frag {
    start: usize,
    out: Vec<Patch>,
}

pub(crate) struct Compiler<'a> {
    bytes: &'a [u8],
    pattern: &'a str,
    pos: usize,
    instructions: Vec<Op>,
    groups: Vec<Option<String>>,
    next_group: usize,
    depth: usize,
}

pub(crate) fn compile(pattern: &str) -> Result<Regex, CompileError> {
    let span = tracing::debug_span!("compile_regex", pattern);
    let _enter = span.enter();

    let mut c = Compiler {
        bytes: pattern.as_bytes(),
        pattern,
        pos: 0,
        instructions: Vec::new(),
        groups: vec![None], // group 0 is the whole match
        next_group: 1,
        depth: 0,
    };

    let _save_start = c.emit(Op::Save(0));
    let body = c.parse_alt()?;
    debug_assert_eq!(body.start, _save_start + 1, "Save(0) must fall through into the body");
    if !c.at_end() {
        return Err(c.error("unexpected character"));
    }
    let save_end = c.emit(Op::Save(1));
    c.patch(body.out, save_end);
    c.emit(Op::Match);

    tracing::debug!(instructions = c.instructions.len(), groups = c.groups.len(), "compiled");

    Ok(Regex {
        instructions: c.instructions,
        groups: c.groups,
        source: pattern.to_string(),
    })
}

impl<'a> Compiler<'a> {
    fn at_end(&self) -> bool {
        self.pos >= self.bytes.len()
    }

    fn peek(&self) -> Option<u8> {
        self.bytes.get(self.pos).copied()
    }

    fn error(&self, message: &str) -> CompileError {
        CompileError {
            pattern: self.pattern.to_string(),
            index: self.pos,
            message: message.to_string(),
        }
    }

    fn emit(&mut self, op: Op) -> usize {
        self.instructions.push(op);
        self.instructions.len() - 1
    }

    fn patch(&mut self, patches: Vec<Patch>, target: usize) {
        for p in patches {
            match p {
                Patch::Jump(i) => {
                    if let Op::Jump(t) = &mut self.instructions[i] {
                        *t = target;
                    }
                }
                Patch::SplitA(i) => {
                    if let Op::Split(a, _) = &mut self.instructions[i] {
                        *a = target;
                    }
                }
                Patch::SplitB(i) => {
                    if let Op::Split(_, b) = &mut self.instructions[i] {
                        *b = target;
                    }
                }
            }
        }
    }

    /// `a | b | c`: each branch retroactively gets a `Split` inserted before
    /// it and a placeholder `Jump` patched to the end once the whole
    /// alternation is known, mirroring the original's retroactive-insert
    /// approach to alternation.
    /// `a | b | c`: a `Split` is appended *after* each branch has already
    /// been compiled, referencing it by instruction index — priority between
    /// branches comes from which `Split` operand each branch sits in, not
    /// from where the `Split` lives in the instruction stream, so it never
    /// needs to be inserted "before" anything.
    fn parse_alt(&mut self) -> Result<Frag, CompileError> {
        let first = self.parse_concat()?;
        if self.peek() != Some(b'|') {
            return Ok(first);
        }

        let mut start = first.start;
        let mut out = first.out;
        while self.peek() == Some(b'|') {
            self.pos += 1;
            let next = self.parse_concat()?;
            let split = self.emit(Op::Split(start, next.start));
            start = split;
            out.extend(next.out);
        }
        Ok(Frag { start, out })
    }

    fn parse_concat(&mut self) -> Result<Frag, CompileError> {
        let mut frag: Option<Frag> = None;
        loop {
            match self.peek() {
                None | Some(b'|') | Some(b')') => break,
                _ => {}
            }
            let next = self.parse_repeat()?;
            let next = match next {
                Some(f) => f,
                None => break,
            };
            frag = Some(match frag {
                None => next,
                Some(prev) => {
                    self.patch(prev.out, next.start);
                    Frag {
                        start: prev.start,
                        out: next.out,
                    }
                }
            });
        }
        match frag {
            Some(f) => Ok(f),
            None => {
                // Empty concatenation (e.g. `()` or `a|`): a no-op jump.
                let idx = self.emit(Op::Jump(0));
                Ok(Frag {
                    start: idx,
                    out: vec![Patch::Jump(idx)],
                })
            }
        }
    }

    fn parse_repeat(&mut self) -> Result<Option<Frag>, CompileError> {
        let atom_start = self.pos;
        let groups_before = self.groups.clone();
        let next_group_before = self.next_group;

        let atom = match self.parse_atom()? {
            Some(a) => a,
            None => return Ok(None),
        };

        let mut frag = atom;

        match self.peek() {
            Some(b'?') => {
                self.pos += 1;
                let lazy = self.consume_lazy_marker();
                frag = self.make_optional(frag, lazy);
            }
            Some(b'*') => {
                self.pos += 1;
                let lazy = self.consume_lazy_marker();
                frag = self.make_star(frag, lazy);
            }
            Some(b'+') => {
                self.pos += 1;
                let lazy = self.consume_lazy_marker();
                frag = self.make_plus(frag, lazy);
            }
            Some(b'{') => {
                let (m, n) = self.parse_bound()?;
                let lazy = self.consume_lazy_marker();
                let re_parse_atom = |c: &mut Compiler<'a>| -> Result<Frag, CompileError> {
                    c.pos = atom_start;
                    c.next_group = next_group_before;
                    c.groups.truncate(groups_before.len());
                    Ok(c.parse_atom()?.expect("same atom parses again"))
                };

                // `frag` is already one copy of the atom; gather `m` of them
                // total (re-parsing the same source text for each extra
                // copy, which also re-registers the same capture group
                // numbers since `next_group`/`groups` are rewound first).
                let mut required = if m == 0 { Vec::new() } else { vec![frag] };
                for _ in 1..m {
                    required.push(re_parse_atom(self)?);
                }

                // Concatenate the required copies into one fragment.
                let mut head: Option<Frag> = None;
                for copy in required {
                    head = Some(match head {
                        None => copy,
                        Some(prev) => {
                            self.patch(prev.out, copy.start);
                            Frag {
                                start: prev.start,
                                out: copy.out,
                            }
                        }
                    });
                }

                let tail = match n {
                    // `{m,}`: one more copy, repeated zero or more times.
                    None => {
                        let extra = re_parse_atom(self)?;
                        Some(self.make_star(extra, lazy))
                    }
                    Some(n) if n > m => {
                        let extra = (n - m).min(MAX_BOUNDED_REPEAT);
                        let mut copies = Vec::with_capacity(extra);
                        for _ in 0..extra {
                            copies.push(re_parse_atom(self)?);
                        }
                        Some(self.make_optional_chain(copies, lazy))
                    }
                    _ => None,
                };

                frag = match (head, tail) {
                    (Some(h), Some(t)) => {
                        self.patch(h.out, t.start);
                        Frag {
                            start: h.start,
                            out: t.out,
                        }
                    }
                    (Some(h), None) => h,
                    (None, Some(t)) => t,
                    (None, None) => {
                        // `{0}`: the atom never runs.
                        let idx = self.emit(Op::Jump(0));
                        Frag {
                            start: idx,
                            out: vec![Patch::Jump(idx)],
                        }
                    }
                };
            }
            _ => {}
        }

        if self.depth > MAX_NESTED_CAPTURE_GROUPS {
            return Err(self.error("capture groups nested too deeply"));
        }

        Ok(Some(frag))
    }

    fn make_optional(&mut self, frag: Frag, lazy: bool) -> Frag {
        let split = self.emit(Op::Split(frag.start, 0));
        let mut out = frag.out;
        out.push(Patch::SplitB(split));
        if lazy {
            self.swap_split(split);
        }
        Frag { start: split, out }
    }

    fn make_star(&mut self, frag: Frag, lazy: bool) -> Frag {
        let split = self.emit(Op::Split(frag.start, 0));
        self.patch(frag.out, split);
        if lazy {
            self.swap_split(split);
        }
        Frag {
            start: split,
            out: vec![Patch::SplitB(split)],
        }
    }

    fn make_plus(&mut self, frag: Frag, lazy: bool) -> Frag {
        let split = self.emit(Op::Split(frag.start, 0));
        self.patch(frag.out, split);
        if lazy {
            self.swap_split(split);
        }
        Frag {
            start: frag.start,
            out: vec![Patch::SplitB(split)],
        }
    }

    /// `a{0,k}`-style tail: a chain of optional copies where skipping one
    /// skips all the rest too (you can't take copy *i+1* without having
    /// taken copy *i*). Built back-to-front so every skip branch jumps
    /// straight to the single shared exit rather than to the next copy.
    fn make_optional_chain(&mut self, copies: Vec<Frag>, lazy: bool) -> Frag {
        let exit = self.emit(Op::Jump(0));
        let mut level = exit;
        for copy in copies.into_iter().rev() {
            self.patch(copy.out, level);
            let split = self.emit(Op::Split(copy.start, exit));
            if lazy {
                self.swap_split(split);
            }
            level = split;
        }
        Frag {
            start: level,
            out: vec![Patch::Jump(exit)],
        }
    }

    fn consume_lazy_marker(&mut self) -> bool {
        if self.peek() == Some(b'?') {
            self.pos += 1;
            true
        } else {
            false
        }
    }

    fn swap_split(&mut self, idx: usize) {
        if let Op::Split(a, b) = &mut self.instructions[idx] {
            std::mem::swap(a, b);
        }
    }

    fn parse_bound(&mut self) -> Result<(usize, Option<usize>), CompileError> {
        debug_assert_eq!(self.peek(), Some(b'{'));
        self.pos += 1;
        let m = self.parse_number()?;
        let n = if self.peek() == Some(b',') {
            self.pos += 1;
            if self.peek() == Some(b'}') {
                None
            } else {
                Some(self.parse_number()?)
            }
        } else {
            Some(m)
        };
        if self.peek() != Some(b'}') {
            return Err(self.error("expected '}'"));
        }
        self.pos += 1;
        if m > MAX_BOUNDED_REPEAT || n.map_or(false, |n| n > MAX_BOUNDED_REPEAT) {
            return Err(self.error("repeat count too large"));
        }
        Ok((m, n))
    }

    fn parse_number(&mut self) -> Result<usize, CompileError> {
        let start = self.pos;
        while matches!(self.peek(), Some(b) if b.is_ascii_digit()) {
            self.pos += 1;
        }
        if start == self.pos {
            return Err(self.error("expected a number"));
        }
        std::str::from_utf8(&self.bytes[start..self.pos])
            .unwrap()
            .parse()
            .map_err(|_| self.error("number out of range"))
    }

    fn parse_atom(&mut self) -> Result<Option<Frag>, CompileError> {
        match self.peek() {
            None | Some(b'|') | Some(b')') => Ok(None),
            Some(b'(') => self.parse_group().map(Some),
            Some(b'.') => {
                self.pos += 1;
                let idx = self.emit(Op::Any);
                Ok(Some(Frag {
                    start: idx,
                    out: vec![],
                }))
            }
            Some(b'[') => self.parse_class().map(Some),
            Some(b'\\') => {
                self.pos += 1;
                let (op, consumed_class) = self.parse_escape()?;
                let idx = self.emit(op);
                let _ = consumed_class;
                Ok(Some(Frag {
                    start: idx,
                    out: vec![],
                }))
            }
            Some(b) => {
                self.pos += 1;
                let idx = self.emit(Op::Char(b));
                Ok(Some(Frag {
                    start: idx,
                    out: vec![],
                }))
            }
        }
        .map(|opt| {
            opt.map(|mut f: Frag| {
                // A leaf atom (Char/Any/Class) has no dangling out recorded
                // above because the instruction's own successor is simply
                // "the next instruction emitted", i.e. a fallthrough; model
                // that uniformly as a Jump patch so concatenation logic
                // never special-cases leaves.
                if f.out.is_empty() {
                    if let Op::Char(_) | Op::Any | Op::Class(_) = &self.instructions[f.start] {
                        let jump = self.emit(Op::Jump(0));
                        f.out = vec![Patch::Jump(jump)];
                    }
                }
                f
            })
        })
    }

    fn parse_escape(&mut self) -> Result<(Op, bool), CompileError> {
        let b = self.peek().ok_or_else(|| self.error("dangling escape"))?;
        self.pos += 1;
        let op = match b {
            b'd' => Op::Class(CharClass::digit()),
            b'D' => Op::Class(CharClass::negate_of(CharClass::digit())),
            b'w' => Op::Class(CharClass::word()),
            b'W' => Op::Class(CharClass::negate_of(CharClass::word())),
            b's' => Op::Class(CharClass::space()),
            b'S' => Op::Class(CharClass::negate_of(CharClass::space())),
            b't' => Op::Char(b'\t'),
            b'n' => Op::Char(b'\n'),
            b'x' => {
                let hi = self.hex_digit()?;
                let lo = self.hex_digit()?;
                Op::Char(hi * 16 + lo)
            }
            other => Op::Char(other),
        };
        Ok((op, false))
    }

    fn hex_digit(&mut self) -> Result<u8, CompileError> {
        let b = self.peek().ok_or_else(|| self.error("expected hex digit"))?;
        let v = match b {
            b'0'..=b'9' => b - b'0',
            b'a'..=b'f' => b - b'a' + 10,
            b'A'..=b'F' => b - b'A' + 10,
            _ => return Err(self.error("invalid hex digit")),
        };
        self.pos += 1;
        Ok(v)
    }

    fn parse_class(&mut self) -> Result<Frag, CompileError> {
        debug_assert_eq!(self.peek(), Some(b'['));
        self.pos += 1;
        let negated = if self.peek() == Some(b'^') {
            self.pos += 1;
            true
        } else {
            false
        };

        let mut class = CharClass::empty();
        let mut first = true;
        loop {
            match self.peek() {
                None => return Err(self.error("unterminated character class")),
                Some(b']') if !first => {
                    self.pos += 1;
                    break;
                }
                _ => {}
            }
            first = false;

            let lo = if self.peek() == Some(b'\\') {
                self.pos += 1;
                let (op, _) = self.parse_escape()?;
                match op {
                    Op::Char(c) => c,
                    Op::Class(c) => {
                        class.union_shorthand(&c);
                        continue;
                    }
                    _ => unreachable!(),
                }
            } else {
                let c = self.peek().unwrap();
                self.pos += 1;
                c
            };

            if self.peek() == Some(b'-') && self.bytes.get(self.pos + 1) != Some(&b']') {
                self.pos += 1;
                let hi = self.peek().ok_or_else(|| self.error("dangling range"))?;
                self.pos += 1;
                class.set_range(lo, hi);
            } else {
                class.set(lo);
            }
        }

        class.negated = negated;
        let idx = self.emit(Op::Class(class));
        let jump = self.emit(Op::Jump(0));
        Ok(Frag {
            start: idx,
            out: vec![Patch::Jump(jump)],
        })
    }

    fn parse_group(&mut self) -> Result<Frag, CompileError> {
        debug_assert_eq!(self.peek(), Some(b'('));
        self.pos += 1;
        self.depth += 1;
        if self.depth > MAX_NESTED_CAPTURE_GROUPS {
            return Err(self.error("capture groups nested too deeply"));
        }

        let capturing;
        let mut name = None;

        if self.bytes[self.pos..].starts_with(b"?:") {
            self.pos += 2;
            capturing = false;
        } else if self.bytes[self.pos..].starts_with(b"?<") {
            self.pos += 2;
            let name_start = self.pos;
            while self.peek().map_or(false, |b| b != b'>') {
                self.pos += 1;
            }
            if self.peek() != Some(b'>') {
                return Err(self.error("unterminated group name"));
            }
            name = Some(
                std::str::from_utf8(&self.bytes[name_start..self.pos])
                    .unwrap()
                    .to_string(),
            );
            self.pos += 1;
            capturing = true;
        } else {
            capturing = true;
        }

        let group_index = if capturing {
            let idx = self.next_group;
            self.next_group += 1;
            if self.groups.len() <= idx {
                self.groups.resize(idx + 1, None);
            }
            self.groups[idx] = name;
            Some(idx)
        } else {
            None
        };

        let open_save = group_index.map(|idx| self.emit(Op::Save(idx * 2)));
        let body = self.parse_alt()?;
        if self.peek() != Some(b')') {
            return Err(self.error("expected ')'"));
        }
        self.pos += 1;
        self.depth -= 1;

        let start = match open_save {
            Some(save_idx) => {
                debug_assert_eq!(body.start, save_idx + 1, "Save falls through into the group body");
                save_idx
            }
            None => body.start,
        };

        let out = match group_index {
            Some(idx) => {
                let close_save = self.emit(Op::Save(idx * 2 + 1));
                self.patch(body.out, close_save);
                let jump = self.emit(Op::Jump(0));
                debug_assert_eq!(jump, close_save + 1, "Save falls through into the trailing jump");
                vec![Patch::Jump(jump)]
            }
            None => body.out,
        };

        Ok(Frag { start, out })
    }
}
