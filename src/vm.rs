//! VM execution core.
//!
//! One `Vm` owns a contiguous arena split into a dictionary/code region
//! grown by `HERE` and a block window region above `DICT_LIMIT`, two
//! bounded stacks, the dictionary, the hot-words cache and the block
//! engine. Threaded bodies are runs of cells holding word ids; the inner
//! interpreter pushes the resume address on the return stack before each
//! call so branch primitives can steer control flow by patching it.

use std::rc::Rc;
use std::sync::Mutex;

use crate::blocks::{BlockEngine, FORTH_BLOCK_SIZE};
use crate::dict::{Dictionary, WordFlags, WordFunc, WordId};
use crate::fixed::{self, Fixed};
use crate::heartbeat::{Heartbeat, TickInput, TickSnapshot};
use crate::host::HostServices;
use crate::hotcache::{HEAT_PROMOTION_THRESHOLD, HotCache};

/// A Forth cell: pointer-width signed integer.
pub type Cell = i64;

/// Byte offset into the VM arena. 0 is valid but reserved for "not present".
pub type VAddr = u32;

/// Cell size in bytes.
pub const CELL: usize = size_of::<Cell>();

/// Total arena size.
pub const VM_MEMORY_SIZE: usize = 5 * 1024 * 1024;

/// Upper bound of the HERE-managed dictionary/code region.
pub const DICT_LIMIT: usize = 1024 * 1024;

/// Maximum depth of each stack.
pub const STACK_DEPTH: usize = 1024;

/// Input buffer capacity.
pub const INPUT_BUFFER_SIZE: usize = 4096;

/// Longest token the parser will produce before splitting.
pub const WORD_BUFFER_SIZE: usize = 64;

/// Direct-mapped block window slots above `DICT_LIMIT`.
pub const WINDOW_SLOTS: usize = (VM_MEMORY_SIZE - DICT_LIMIT) / FORTH_BLOCK_SIZE;

/// Interpreter mode. `STATE` mirrors this as 0 / -1.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mode {
    Interpret,
    Compile,
}

pub struct Vm {
    pub(crate) memory: Vec<u8>,
    pub(crate) here: usize,
    pub(crate) data_stack: Vec<Cell>,
    pub(crate) return_stack: Vec<Cell>,
    pub dict: Dictionary,
    pub cache: HotCache,
    pub blocks: BlockEngine,
    pub(crate) host: Rc<dyn HostServices>,

    mode: Mode,
    pub(crate) state_var: Cell,
    pub(crate) scr_addr: VAddr,
    pub(crate) state_addr: VAddr,
    pub(crate) base_addr: VAddr,
    base: Cell,

    pub(crate) compiling: Option<WordId>,
    pub(crate) current_word: Option<WordId>,

    pub error: bool,
    pub halted: bool,
    pub(crate) exit_colon: bool,
    pub(crate) abort_requested: bool,

    input: Vec<u8>,
    input_pos: usize,

    /// Boot fence: FORGET may not reach below this.
    pub(crate) fence_entries: usize,
    pub(crate) fence_here: usize,

    pub(crate) prng_state: u64,
    pub heartbeat: Heartbeat,
    pub(crate) word_executions: u64,

    /// Guards structure-mutating dictionary operations and the guardrail
    /// walk. Lookups and heat bumps run unlocked.
    pub(crate) dict_lock: Mutex<()>,

    window_lbn: Vec<Option<u32>>,
    pub(crate) last_block: Option<u32>,

    /// Nesting depth of colon bodies currently executing. Non-zero means
    /// the top of the return stack is a resume address.
    colon_depth: u32,
}

impl Vm {
    pub fn new(host: Rc<dyn HostServices>) -> Self {
        let mut vm = Self {
            memory: vec![0u8; VM_MEMORY_SIZE],
            here: 0,
            data_stack: Vec::with_capacity(STACK_DEPTH),
            return_stack: Vec::with_capacity(STACK_DEPTH),
            dict: Dictionary::new(),
            cache: HotCache::new(),
            blocks: BlockEngine::new(),
            host,
            mode: Mode::Interpret,
            state_var: 0,
            scr_addr: 0,
            state_addr: 0,
            base_addr: 0,
            base: 10,
            compiling: None,
            current_word: None,
            error: false,
            halted: false,
            exit_colon: false,
            abort_requested: false,
            input: Vec::new(),
            input_pos: 0,
            fence_entries: 0,
            fence_here: 0,
            prng_state: 1,
            heartbeat: Heartbeat::default(),
            word_executions: 0,
            dict_lock: Mutex::new(()),
            window_lbn: vec![None; WINDOW_SLOTS],
            last_block: None,
            colon_depth: 0,
        };

        vm.align();
        vm.scr_addr = vm.allot(CELL).unwrap_or(0);
        vm.store_cell(vm.scr_addr, 0);
        vm.state_addr = vm.allot(CELL).unwrap_or(0);
        vm.store_cell(vm.state_addr, 0);
        vm.base_addr = vm.allot(CELL).unwrap_or(0);
        vm.set_base(10);

        crate::words::register_core(&mut vm);

        vm.fence_entries = vm.dict.len();
        vm.fence_here = vm.here;
        let now = vm.host.monotonic_ns();
        vm.heartbeat.start(now);
        vm
    }

    // ===== error handling =====

    pub(crate) fn fail(&mut self, msg: &str) {
        log::error!("{msg}");
        self.error = true;
    }

    /// Outer-interpreter quiesce: clear the sticky error and one-shot
    /// flags, empty both stacks, return to interpret mode. A smudged
    /// partial definition stays in the dictionary, invisible to lookup.
    pub fn quiesce(&mut self) {
        self.error = false;
        self.exit_colon = false;
        self.abort_requested = false;
        self.data_stack.clear();
        self.return_stack.clear();
        self.compiling = None;
        self.set_mode(Mode::Interpret);
    }

    /// ABORT: clear both stacks and request unwind to the outer loop.
    pub fn abort(&mut self) {
        self.data_stack.clear();
        self.return_stack.clear();
        self.abort_requested = true;
    }

    // ===== stacks =====

    pub fn push(&mut self, v: Cell) {
        if self.data_stack.len() >= STACK_DEPTH {
            self.fail("data stack overflow");
            return;
        }
        self.data_stack.push(v);
    }

    pub fn pop(&mut self) -> Cell {
        match self.data_stack.pop() {
            Some(v) => v,
            None => {
                self.fail("data stack underflow");
                0
            }
        }
    }

    #[must_use]
    pub fn depth(&self) -> usize {
        self.data_stack.len()
    }

    /// Peek `n` cells below the top (0 = top).
    pub fn peek(&mut self, n: usize) -> Cell {
        let len = self.data_stack.len();
        if n >= len {
            self.fail("data stack underflow");
            return 0;
        }
        self.data_stack[len - 1 - n]
    }

    pub fn rpush(&mut self, v: Cell) {
        if self.return_stack.len() >= STACK_DEPTH {
            self.fail("return stack overflow");
            return;
        }
        self.return_stack.push(v);
    }

    pub fn rpop(&mut self) -> Cell {
        match self.return_stack.pop() {
            Some(v) => v,
            None => {
                self.fail("return stack underflow");
                0
            }
        }
    }

    #[must_use]
    pub fn rdepth(&self) -> usize {
        self.return_stack.len()
    }

    /// Mutable top of the return stack: the resume address patched by
    /// branch primitives.
    pub(crate) fn rtop_mut(&mut self) -> Option<&mut Cell> {
        if self.return_stack.is_empty() {
            self.fail("return stack underflow");
            return None;
        }
        self.return_stack.last_mut()
    }

    /// Whether a resume address is currently on top of the return stack.
    #[must_use]
    pub(crate) fn in_colon(&self) -> bool {
        self.colon_depth > 0
    }

    /// Push a user value on the return stack, keeping the resume address
    /// on top while a colon body is executing.
    pub(crate) fn rpush_user(&mut self, v: Cell) {
        if self.in_colon() {
            let resume = self.rpop();
            self.rpush(v);
            self.rpush(resume);
        } else {
            self.rpush(v);
        }
    }

    /// Pop the topmost user value, reaching under the resume address.
    pub(crate) fn rpop_user(&mut self) -> Cell {
        if self.in_colon() {
            let resume = self.rpop();
            let v = self.rpop();
            self.rpush(resume);
            v
        } else {
            self.rpop()
        }
    }

    /// Read the user value `n` cells below the topmost (0 = topmost),
    /// skipping the resume address.
    pub(crate) fn rpeek_user(&mut self, n: usize) -> Cell {
        let skip = usize::from(self.in_colon());
        let len = self.return_stack.len();
        let want = n + skip;
        if want >= len {
            self.fail("return stack underflow");
            return 0;
        }
        self.return_stack[len - 1 - want]
    }

    /// Pop a cell and validate it as an arena address.
    pub(crate) fn pop_vaddr(&mut self) -> Option<VAddr> {
        let v = self.pop();
        if self.error {
            return None;
        }
        if v < 0 || v as usize >= VM_MEMORY_SIZE {
            self.fail(&format!("address {v} outside VM memory"));
            return None;
        }
        Some(v as VAddr)
    }

    // ===== arena =====

    #[must_use]
    pub fn here(&self) -> usize {
        self.here
    }

    /// Advance HERE by `n` bytes. Filling the region exactly is allowed;
    /// crossing `DICT_LIMIT` fails. `allot(0)` cannot fail.
    pub fn allot(&mut self, n: usize) -> Option<VAddr> {
        if n == 0 {
            return Some(self.here as VAddr);
        }
        if self.here + n > DICT_LIMIT {
            self.fail(&format!(
                "dictionary space full (here={}, request={n})",
                self.here
            ));
            return None;
        }
        let at = self.here as VAddr;
        self.here += n;
        Some(at)
    }

    /// Roll HERE back (FORGET and negative ALLOT). Clamped to the boot fence.
    pub(crate) fn reclaim_to(&mut self, here: usize) {
        self.here = here.clamp(self.fence_here, self.here);
    }

    /// Round HERE up to the next cell boundary, zero-filling the pad.
    pub fn align(&mut self) {
        let rem = self.here % CELL;
        if rem != 0 {
            let pad = CELL - rem;
            if let Some(at) = self.allot(pad) {
                self.memory[at as usize..at as usize + pad].fill(0);
            }
        }
    }

    fn addr_ok(&self, addr: VAddr, len: usize) -> bool {
        len <= VM_MEMORY_SIZE && (addr as usize) <= VM_MEMORY_SIZE - len
    }

    pub fn load_cell(&mut self, addr: VAddr) -> Cell {
        if !self.addr_ok(addr, CELL) || addr as usize % CELL != 0 {
            self.fail(&format!("bad cell load at {addr}"));
            return 0;
        }
        let at = addr as usize;
        Cell::from_le_bytes(self.memory[at..at + CELL].try_into().unwrap())
    }

    pub fn store_cell(&mut self, addr: VAddr, v: Cell) {
        if !self.addr_ok(addr, CELL) || addr as usize % CELL != 0 {
            self.fail(&format!("bad cell store at {addr}"));
            return;
        }
        let at = addr as usize;
        self.memory[at..at + CELL].copy_from_slice(&v.to_le_bytes());
    }

    pub fn load_u8(&mut self, addr: VAddr) -> u8 {
        if !self.addr_ok(addr, 1) {
            self.fail(&format!("bad byte load at {addr}"));
            return 0;
        }
        self.memory[addr as usize]
    }

    pub fn store_u8(&mut self, addr: VAddr, v: u8) {
        if !self.addr_ok(addr, 1) {
            self.fail(&format!("bad byte store at {addr}"));
            return;
        }
        self.memory[addr as usize] = v;
    }

    /// Append one cell at HERE.
    pub fn comma(&mut self, v: Cell) {
        self.align();
        if let Some(at) = self.allot(CELL) {
            self.store_cell(at, v);
        }
    }

    // ===== BASE and STATE =====

    pub fn get_base(&mut self) -> u32 {
        let addr = self.base_addr;
        if addr as usize % CELL == 0 && self.addr_ok(addr, CELL) {
            let at = addr as usize;
            let v = Cell::from_le_bytes(self.memory[at..at + CELL].try_into().unwrap());
            if (2..=36).contains(&v) {
                return v as u32;
            }
        }
        if (2..=36).contains(&self.base) {
            return self.base as u32;
        }
        10
    }

    pub fn set_base(&mut self, base: u32) {
        let base = if (2..=36).contains(&base) { base } else { 10 };
        self.store_cell(self.base_addr, base as Cell);
        self.base = base as Cell;
    }

    #[must_use]
    pub fn mode(&self) -> Mode {
        self.mode
    }

    /// Switch mode, keeping the host mirror and the in-arena STATE cell in
    /// sync as one transition.
    pub fn set_mode(&mut self, mode: Mode) {
        self.mode = mode;
        self.state_var = match mode {
            Mode::Interpret => 0,
            Mode::Compile => -1,
        };
        let addr = self.state_addr;
        let v = self.state_var;
        self.store_cell(addr, v);
    }

    // ===== parser =====

    /// Copy `input` into the input buffer and reset the scan position.
    pub fn set_input(&mut self, input: &str) {
        let bytes = input.as_bytes();
        let n = bytes.len().min(INPUT_BUFFER_SIZE - 1);
        self.input.clear();
        self.input.extend_from_slice(&bytes[..n]);
        self.input_pos = 0;
    }

    /// Next whitespace-delimited token, at most `WORD_BUFFER_SIZE - 1`
    /// bytes; longer runs split.
    pub fn parse_word(&mut self) -> Option<Vec<u8>> {
        while self.input_pos < self.input.len() {
            let c = self.input[self.input_pos];
            if !matches!(c, b' ' | b'\t' | b'\n' | b'\r') {
                break;
            }
            self.input_pos += 1;
        }
        if self.input_pos >= self.input.len() {
            return None;
        }

        let mut word = Vec::new();
        while self.input_pos < self.input.len() && word.len() < WORD_BUFFER_SIZE - 1 {
            let c = self.input[self.input_pos];
            if matches!(c, b' ' | b'\t' | b'\n' | b'\r') {
                break;
            }
            word.push(c);
            self.input_pos += 1;
        }
        Some(word)
    }

    /// Skip the single blank that delimits a parsing word from its text.
    pub(crate) fn skip_one_blank(&mut self) {
        if self.input.get(self.input_pos) == Some(&b' ') {
            self.input_pos += 1;
        }
    }

    /// Skip input up to and including `delim`. Returns the skipped bytes.
    pub(crate) fn parse_until(&mut self, delim: u8) -> Vec<u8> {
        let start = self.input_pos;
        while self.input_pos < self.input.len() && self.input[self.input_pos] != delim {
            self.input_pos += 1;
        }
        let text = self.input[start..self.input_pos].to_vec();
        if self.input_pos < self.input.len() {
            self.input_pos += 1;
        }
        text
    }

    /// Parse a number in the current BASE: one optional sign, then digits;
    /// letters `A..Z` (either case) continue past `9`.
    pub fn parse_number(&mut self, s: &[u8]) -> Option<Cell> {
        if s.is_empty() {
            return None;
        }
        let base = self.get_base() as u64;
        let (neg, digits) = match s[0] {
            b'-' => (true, &s[1..]),
            b'+' => (false, &s[1..]),
            _ => (false, s),
        };
        if digits.is_empty() {
            return None;
        }

        let mut acc: u64 = 0;
        for &c in digits {
            let d = match c {
                b'0'..=b'9' => u64::from(c - b'0'),
                b'A'..=b'Z' => u64::from(c - b'A') + 10,
                b'a'..=b'z' => u64::from(c - b'a') + 10,
                _ => return None,
            };
            if d >= base {
                return None;
            }
            acc = acc.wrapping_mul(base).wrapping_add(d);
        }
        let v = acc as Cell;
        Some(if neg { v.wrapping_neg() } else { v })
    }

    /// Render a cell in the current BASE.
    pub fn format_cell(&mut self, v: Cell) -> String {
        let base = self.get_base() as u64;
        if base == 10 {
            return v.to_string();
        }
        let neg = v < 0;
        let mut mag = v.unsigned_abs();
        let mut digits = Vec::new();
        loop {
            let d = (mag % base) as u8;
            digits.push(if d < 10 { b'0' + d } else { b'A' + d - 10 });
            mag /= base;
            if mag == 0 {
                break;
            }
        }
        if neg {
            digits.push(b'-');
        }
        digits.reverse();
        String::from_utf8(digits).unwrap()
    }

    // ===== dictionary helpers =====

    pub fn define_primitive(&mut self, name: &str, func: fn(&mut Vm)) -> WordId {
        let _guard = self.dict_lock.lock().unwrap_or_else(|e| e.into_inner());
        let here = self.here as VAddr;
        self.dict
            .create(name.as_bytes(), WordFunc::Primitive(func), 0, here)
            .expect("primitive name fits")
    }

    pub fn define_immediate(&mut self, name: &str, func: fn(&mut Vm)) -> WordId {
        let id = self.define_primitive(name, func);
        self.dict.entry_mut(id).flags |= WordFlags::IMMEDIATE;
        id
    }

    /// Dictionary lookup through the hot cache.
    pub fn find_word(&mut self, name: &[u8]) -> Option<WordId> {
        let host = self.host.clone();
        self.cache.find(&mut self.dict, &*host, name)
    }

    /// Mark the most recent definition IMMEDIATE.
    pub fn make_immediate(&mut self) {
        match self.dict.latest() {
            Some(id) => self.dict.entry_mut(id).flags |= WordFlags::IMMEDIATE,
            None => self.fail("IMMEDIATE: no latest word"),
        }
    }

    /// FORGET back to `name`, restoring HERE. Fails below the boot fence.
    pub fn forget(&mut self, name: &[u8]) {
        let Some(id) = self.dict.probe_any(name) else {
            self.fail(&format!(
                "FORGET: unknown word '{}'",
                String::from_utf8_lossy(name)
            ));
            return;
        };
        if (id as usize) < self.fence_entries {
            self.fail("FORGET: word is below the boot fence");
            return;
        }
        let guard = self.dict_lock.lock().unwrap_or_else(|e| e.into_inner());
        let here = self.dict.forget_to(id as usize);
        drop(guard);
        if let Some(here) = here {
            self.reclaim_to(here as usize);
        }
        self.cache.purge_from(id as usize);
    }

    // ===== compile state =====

    /// `:` — create a smudged colon entry whose first data cell holds the
    /// vaddr of the body that follows, then enter compile mode.
    pub fn enter_compile_mode(&mut self, name: &[u8]) {
        self.align();
        let here_mark = self.here as VAddr;
        let Some(dfa) = self.allot(CELL) else {
            return;
        };
        let body = self.here as Cell;
        self.store_cell(dfa, body);

        let guard = self.dict_lock.lock().unwrap_or_else(|e| e.into_inner());
        let created = self.dict.create(name, WordFunc::Colon, dfa, here_mark);
        drop(guard);
        let id = match created {
            Ok(id) => id,
            Err(err) => {
                self.fail(&format!(": {err}"));
                return;
            }
        };
        self.dict.entry_mut(id).flags |= WordFlags::SMUDGED | WordFlags::COMPILED;
        self.compiling = Some(id);
        self.set_mode(Mode::Compile);
        log::debug!(
            ": started '{}' at HERE={}",
            String::from_utf8_lossy(name),
            self.here
        );
    }

    /// `;` — compile EXIT, clear the smudge, return to interpret mode.
    pub fn exit_compile_mode(&mut self) {
        let Some(id) = self.compiling else {
            self.fail("; outside a definition");
            return;
        };
        self.compile_exit();
        if self.error {
            return;
        }
        self.dict.entry_mut(id).flags -= WordFlags::SMUDGED;
        self.compiling = None;
        self.set_mode(Mode::Interpret);
        log::debug!("; end definition");
    }

    /// Append a reference to `id` to the open body.
    pub fn compile_word(&mut self, id: WordId) {
        if self.mode != Mode::Compile {
            self.fail("compile outside compile mode");
            return;
        }
        self.comma(id as Cell);
    }

    /// Compile a literal (LIT reference plus payload cell); in interpret
    /// mode the value just goes on the stack.
    pub fn compile_literal(&mut self, v: Cell) {
        if self.mode != Mode::Compile {
            self.push(v);
            return;
        }
        let Some(lit) = self.dict.probe(b"LIT") else {
            self.fail("LIT not found");
            return;
        };
        self.compile_word(lit);
        self.comma(v);
    }

    pub fn compile_exit(&mut self) {
        let Some(exit) = self.dict.probe(b"EXIT") else {
            self.fail("EXIT not found");
            return;
        };
        self.compile_word(exit);
    }

    // ===== execution =====

    /// Execute a word by id, tracking telemetry.
    pub fn execute_id(&mut self, id: WordId) {
        if id as usize >= self.dict.len() {
            self.fail(&format!("execute of invalid word id {id}"));
            return;
        }
        let start = self.host.monotonic_ns();
        self.word_executions += 1;
        self.heartbeat.window.note_executions(1);

        let prev = self.current_word.replace(id);
        let func = self.dict.entry(id).func;
        match func {
            WordFunc::Primitive(func) => func(self),
            WordFunc::Colon => self.execute_colon(id),
        }
        self.current_word = prev;

        let now = self.host.monotonic_ns();
        let elapsed = now - start;
        let entry = self.dict.entry_mut(id);
        entry.physics.last_active_ns = now;
        entry.physics.avg_latency_ns =
            entry.physics.avg_latency_ns - entry.physics.avg_latency_ns / 8 + elapsed / 8;
        entry.physics.temperature_q8 = entry.execution_heat >> 8;
    }

    /// Inner interpreter: walk the threaded body of a colon word.
    ///
    /// Contract: the resume address goes on the return stack before each
    /// call; branch runtimes patch it there. EXIT sets a one-shot flag and
    /// the saved resume address is discarded, leaving the caller's frame
    /// untouched.
    fn execute_colon(&mut self, id: WordId) {
        let dfa = self.dict.entry(id).dfa;
        let body = self.load_cell(dfa);
        if self.error {
            return;
        }
        self.colon_depth += 1;
        self.run_colon_body(body as VAddr);
        self.colon_depth -= 1;
    }

    fn run_colon_body(&mut self, body: VAddr) {
        let mut ip = body;
        loop {
            let token = self.load_cell(ip);
            if self.error {
                return;
            }
            ip += CELL as VAddr;
            self.rpush(ip as Cell);
            if self.error {
                return;
            }

            self.execute_id(token as WordId);
            if self.error {
                return;
            }
            // Leave the flag set so every enclosing frame unwinds too; the
            // outer interpreter clears it.
            if self.abort_requested {
                return;
            }
            if self.exit_colon {
                self.exit_colon = false;
                // Discard the per-step resume address without using it.
                let _ = self.rpop();
                return;
            }

            ip = self.rpop() as VAddr;
            if self.error {
                return;
            }
        }
    }

    /// Outer interpreter step for one token.
    pub fn interpret_token(&mut self, token: &[u8]) {
        if let Some(id) = self.find_word(token) {
            let immediate = self.dict.entry(id).is_immediate();
            if self.mode == Mode::Compile && !immediate {
                self.compile_word(id);
                return;
            }
            self.execute_id(id);
            return;
        }

        if let Some(v) = self.parse_number(token) {
            if self.mode == Mode::Compile {
                self.compile_literal(v);
            } else {
                self.push(v);
            }
            return;
        }

        self.fail(&format!(
            "unknown word: '{}'",
            String::from_utf8_lossy(token)
        ));
    }

    /// Interpret a line of source.
    pub fn interpret(&mut self, input: &str) {
        self.set_input(input);
        while !self.error && !self.halted {
            let Some(token) = self.parse_word() else {
                break;
            };
            self.interpret_token(&token);
            if self.abort_requested {
                self.abort_requested = false;
                break;
            }
        }
    }

    // ===== block window =====

    /// Map a Forth block into the window region and return its vaddr.
    pub fn block_vaddr(&mut self, lbn: u32, empty: bool) -> Option<VAddr> {
        let slot = lbn as usize % WINDOW_SLOTS;
        let at = DICT_LIMIT + slot * FORTH_BLOCK_SIZE;
        let result = if empty {
            self.blocks.get_empty_buffer(lbn)
        } else {
            self.blocks.get_buffer(lbn, false)
        };
        match result {
            Ok(buf) => self.memory[at..at + FORTH_BLOCK_SIZE].copy_from_slice(buf),
            Err(err) => {
                self.fail(&format!("BLOCK: {err}"));
                return None;
            }
        }
        self.window_lbn[slot] = Some(lbn);
        self.last_block = Some(lbn);
        self.store_cell(self.scr_addr, lbn as Cell);
        Some(at as VAddr)
    }

    /// UPDATE: copy the most recently mapped block back and mark it dirty.
    pub fn block_update(&mut self) {
        let Some(lbn) = self.last_block else {
            self.fail("UPDATE: no current block");
            return;
        };
        let slot = lbn as usize % WINDOW_SLOTS;
        if self.window_lbn[slot] == Some(lbn) {
            let at = DICT_LIMIT + slot * FORTH_BLOCK_SIZE;
            match self.blocks.get_buffer(lbn, true) {
                Ok(buf) => buf.copy_from_slice(&self.memory[at..at + FORTH_BLOCK_SIZE]),
                Err(err) => {
                    self.fail(&format!("UPDATE: {err}"));
                    return;
                }
            }
        }
        let host = self.host.clone();
        if let Err(err) = self.blocks.update(lbn, &*host) {
            self.fail(&format!("UPDATE: {err}"));
        }
    }

    pub fn block_flush(&mut self, lbn: u32) {
        if let Err(err) = self.blocks.flush(lbn) {
            self.fail(&format!("FLUSH: {err}"));
        }
    }

    /// EMPTY-BUFFERS: discard cached block state and window mappings.
    pub fn empty_buffers(&mut self) {
        self.blocks.empty_buffers();
        self.window_lbn.fill(None);
        self.last_block = None;
    }

    // ===== misc services =====

    pub fn print(&self, s: &str) {
        self.host.puts(s);
    }

    pub fn print_char(&self, c: char) {
        self.host.putc(c);
    }

    #[must_use]
    pub fn host(&self) -> Rc<dyn HostServices> {
        self.host.clone()
    }

    /// LCG step (Numerical Recipes constants).
    pub(crate) fn prng_next(&mut self) -> Cell {
        self.prng_state = self
            .prng_state
            .wrapping_mul(6_364_136_223_846_793_005)
            .wrapping_add(1_442_695_040_888_963_407);
        (self.prng_state >> 33) as Cell
    }

    #[must_use]
    pub fn word_executions(&self) -> u64 {
        self.word_executions
    }

    /// Capture one heartbeat tick.
    pub fn heartbeat_tick(&mut self) -> TickSnapshot {
        let mut hot_words = 0u64;
        let mut total_heat: Fixed = 0;
        let mut counted = 0u64;
        for id in 0..self.dict.len() as WordId {
            let heat = self.dict.entry(id).execution_heat;
            if heat > 0 {
                total_heat += heat;
                counted += 1;
                if heat >= HEAT_PROMOTION_THRESHOLD {
                    hot_words += 1;
                }
            }
        }
        let avg_heat = if counted > 0 {
            fixed::to_f64(total_heat / counted as Fixed)
        } else {
            0.0
        };

        let input = TickInput {
            now_ns: self.host.monotonic_ns(),
            cache_hits: self.cache.stats.cache_hits,
            bucket_hits: self.cache.stats.bucket_hits,
            word_executions: self.word_executions,
            hot_word_count: hot_words,
            avg_word_heat: avg_heat,
        };
        self.heartbeat.capture(input)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::host::CapturingHost;

    fn test_vm() -> (Vm, Rc<CapturingHost>) {
        let host = Rc::new(CapturingHost::new());
        (Vm::new(host.clone()), host)
    }

    #[test]
    fn parser_splits_on_whitespace() {
        let (mut vm, _host) = test_vm();
        vm.set_input("  DUP \t 42\n SWAP ");
        assert_eq!(Some(b"DUP".to_vec()), vm.parse_word());
        assert_eq!(Some(b"42".to_vec()), vm.parse_word());
        assert_eq!(Some(b"SWAP".to_vec()), vm.parse_word());
        assert_eq!(None, vm.parse_word());
    }

    #[test]
    fn parse_number_respects_base() {
        let (mut vm, _host) = test_vm();
        assert_eq!(Some(42), vm.parse_number(b"42"));
        assert_eq!(Some(-17), vm.parse_number(b"-17"));
        assert_eq!(Some(17), vm.parse_number(b"+17"));
        assert_eq!(None, vm.parse_number(b""));
        assert_eq!(None, vm.parse_number(b"-"));
        assert_eq!(None, vm.parse_number(b"12X"));
        assert_eq!(None, vm.parse_number(b"--3"));

        vm.set_base(16);
        assert_eq!(Some(0xFF), vm.parse_number(b"FF"));
        assert_eq!(Some(0xff), vm.parse_number(b"ff"));
        vm.set_base(2);
        assert_eq!(Some(5), vm.parse_number(b"101"));
        assert_eq!(None, vm.parse_number(b"102"));
    }

    #[test]
    fn stacks_bound_at_depth() {
        let (mut vm, _host) = test_vm();
        for i in 0..STACK_DEPTH as Cell {
            vm.push(i);
        }
        assert!(!vm.error);
        vm.push(0);
        assert!(vm.error);
        vm.quiesce();
        vm.pop();
        assert!(vm.error);
    }

    #[test]
    fn allot_bounds_and_align() {
        let (mut vm, _host) = test_vm();
        let before = vm.here();
        assert_eq!(Some(before as VAddr), vm.allot(0));
        assert_eq!(before, vm.here());

        vm.allot(3);
        vm.align();
        assert_eq!(0, vm.here() % CELL);

        let remaining = DICT_LIMIT - vm.here();
        assert!(vm.allot(remaining + 1).is_none());
        assert!(vm.error);
        vm.quiesce();
        assert!(vm.allot(remaining).is_some());
        assert_eq!(DICT_LIMIT, vm.here());
    }

    #[test]
    fn state_mirror_stays_in_sync() {
        let (mut vm, _host) = test_vm();
        assert_eq!(Mode::Interpret, vm.mode());
        assert_eq!(0, vm.load_cell(vm.state_addr));

        vm.set_mode(Mode::Compile);
        assert_eq!(-1, vm.state_var);
        assert_eq!(-1, vm.load_cell(vm.state_addr));

        vm.set_mode(Mode::Interpret);
        assert_eq!(0, vm.state_var);
        assert_eq!(0, vm.load_cell(vm.state_addr));
    }

    #[test]
    fn format_cell_in_bases() {
        let (mut vm, _host) = test_vm();
        assert_eq!("42", vm.format_cell(42));
        assert_eq!("-42", vm.format_cell(-42));
        vm.set_base(16);
        assert_eq!("2A", vm.format_cell(42));
        assert_eq!("-FF", vm.format_cell(-255));
        vm.set_base(2);
        assert_eq!("101", vm.format_cell(5));
    }

    #[test]
    fn unknown_word_sets_sticky_error() {
        let (mut vm, _host) = test_vm();
        vm.interpret("NOSUCHWORDHERE");
        assert!(vm.error);
        // Sticky until quiesce.
        vm.interpret("1 2");
        assert_eq!(0, vm.depth());
        vm.quiesce();
        vm.interpret("1 2");
        assert_eq!(2, vm.depth());
    }
}
