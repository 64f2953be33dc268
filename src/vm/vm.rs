use std::collections::HashMap;
use std::fs;
use std::io::{self, Cursor, Write};
use std::path::{Path, PathBuf};
use std::rc::Rc;

use tracing::{debug, trace, warn};

use crate::compiler::{self, IdentMode};
use crate::config::RuntimeConfig;
use crate::debugger::{ConsoleTap, TelnetDebugger};
use crate::error::{ConsoleError, ExecError};
use crate::vm::builtins;
use crate::vm::bytecode;
use crate::vm::codeblock::{CodeBlock, CodeBlockRegistry};
use crate::vm::namespace::{Namespaces, ScriptFunction};
use crate::vm::objects::ObjectRegistry;
use crate::vm::ops::{CallType, Instruction, Kind};
use crate::vm::symbols::{SymbolId, SymbolTable};
use crate::vm::value::Value;

/// A script call frame: one per function invocation or top-level execution.
#[derive(Debug)]
struct Frame {
    block: Rc<CodeBlock>,
    /// Last instruction reported for this frame (statement start or call).
    ip: u32,
    function: Option<Rc<ScriptFunction>>,
    locals: HashMap<String, Value>,
}

/// One entry of a stack trace, innermost first.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FrameInfo {
    pub file: String,
    pub line: u32,
    pub scope: String,
}

/// Execution counters.
#[derive(Debug, Clone, Default)]
pub struct ExecStats {
    pub instructions: u64,
    pub calls: u64,
    pub blocks_compiled: u64,
}

/// How a compile-and-run executes.
#[derive(Debug, Clone, Copy, Default)]
pub struct ExecOptions {
    /// Calls made from the block's top level evaluate to `""` without
    /// running anything. Function declarations still register.
    pub no_calls: bool,
    /// Run inside an existing frame (counted from the innermost) instead of
    /// a fresh one, sharing its locals.
    pub frame: Option<usize>,
}

enum IterItems {
    Objects(Vec<u32>),
    Words(Vec<String>),
}

struct IterState {
    var: String,
    items: IterItems,
    next: usize,
}

/// Registers and stacks local to one activation of the interpreter loop.
#[derive(Default)]
struct ExecState {
    stack: Vec<Value>,
    arg_frames: Vec<Vec<Value>>,
    iters: Vec<IterState>,
    new_objects: Vec<u32>,
    cur_var: Option<String>,
    cur_object: Option<u32>,
    cur_field: Option<String>,
}

impl ExecState {
    fn pop(&mut self, ip: u32) -> Result<Value, ExecError> {
        self.stack.pop().ok_or(ExecError::StackUnderflow { ip })
    }

    fn top(&self, ip: u32) -> Result<&Value, ExecError> {
        self.stack.last().ok_or(ExecError::StackUnderflow { ip })
    }

    fn push(&mut self, value: Value) {
        self.stack.push(value);
    }
}

struct Activation {
    block: Rc<CodeBlock>,
    frame: usize,
    in_function: bool,
    no_calls: bool,
    /// Whether this activation owns its frame (and so reports its ip).
    owns_frame: bool,
}

/// A caller parked while a script function it called runs.
struct Suspended {
    act: Activation,
    state: ExecState,
    resume_ip: u32,
}

/// Where a call lands once its name is resolved.
enum Callee {
    Script(Rc<ScriptFunction>, Vec<Value>),
    Done(Value),
}

/// The console interpreter.
pub struct VM {
    config: RuntimeConfig,
    symbols: SymbolTable,
    globals: HashMap<String, Value>,
    frames: Vec<Frame>,
    objects: ObjectRegistry,
    namespaces: Namespaces,
    blocks: CodeBlockRegistry,
    tagged_strings: Vec<String>,
    stats: ExecStats,
    debugger: Option<TelnetDebugger>,
    console_tap: Option<ConsoleTap>,
    /// Output stream for console text (`echo`, `warn`, `error`)
    output: Box<dyn Write>,
}

impl Default for VM {
    fn default() -> Self {
        Self::new()
    }
}

impl VM {
    pub fn new() -> Self {
        Self::with_config(RuntimeConfig::default(), Box::new(io::stdout()))
    }

    /// Create a VM with a custom output stream.
    pub fn with_output(output: Box<dyn Write>) -> Self {
        Self::with_config(RuntimeConfig::default(), output)
    }

    pub fn with_config(config: RuntimeConfig, output: Box<dyn Write>) -> Self {
        Self {
            config,
            symbols: SymbolTable::new(),
            globals: HashMap::new(),
            frames: Vec::with_capacity(64),
            objects: ObjectRegistry::new(),
            namespaces: Namespaces::new(),
            blocks: CodeBlockRegistry::new(),
            tagged_strings: Vec::new(),
            stats: ExecStats::default(),
            debugger: None,
            console_tap: None,
            output,
        }
    }

    pub fn config(&self) -> &RuntimeConfig {
        &self.config
    }

    pub fn stats(&self) -> &ExecStats {
        &self.stats
    }

    pub fn symbols(&self) -> &SymbolTable {
        &self.symbols
    }

    pub fn objects(&self) -> &ObjectRegistry {
        &self.objects
    }

    pub fn objects_mut(&mut self) -> &mut ObjectRegistry {
        &mut self.objects
    }

    pub fn namespaces(&self) -> &Namespaces {
        &self.namespaces
    }

    pub fn blocks(&self) -> &CodeBlockRegistry {
        &self.blocks
    }

    /// Number of live script frames.
    pub fn call_depth(&self) -> usize {
        self.frames.len()
    }

    fn global_key(name: &str) -> String {
        let lower = name.to_ascii_lowercase();
        if lower.starts_with('$') {
            lower
        } else {
            format!("${lower}")
        }
    }

    /// Read a global variable; the `$` sigil is optional.
    pub fn global(&self, name: &str) -> Option<&Value> {
        self.globals.get(&Self::global_key(name))
    }

    pub fn set_global(&mut self, name: &str, value: impl Into<Value>) {
        self.globals.insert(Self::global_key(name), value.into());
    }

    /// Original text of a tag id handed out by `TAG_TO_STR`.
    pub fn tagged_string(&self, tag: u32) -> Option<&str> {
        let index = tag.checked_sub(1)? as usize;
        self.tagged_strings.get(index).map(String::as_str)
    }

    /// Write a line of console output, mirroring it to a debugger client.
    pub fn print_line(&mut self, text: &str) {
        if let Err(e) = writeln!(self.output, "{text}") {
            warn!(error = %e, "failed to write console output");
        }
        if let Some(tap) = &self.console_tap {
            tap.send(text);
        }
    }

    pub fn flush(&mut self) {
        let _ = self.output.flush();
    }

    // ========================================
    // Debugger
    // ========================================

    pub fn attach_debugger(&mut self, debugger: TelnetDebugger) {
        self.console_tap = Some(debugger.console_tap());
        self.debugger = Some(debugger);
    }

    pub fn detach_debugger(&mut self) -> Option<TelnetDebugger> {
        self.console_tap = None;
        self.debugger.take()
    }

    pub fn debugger(&self) -> Option<&TelnetDebugger> {
        self.debugger.as_ref()
    }

    /// Service pending debugger traffic while no script is paused.
    pub fn poll_debugger(&mut self) {
        if let Some(mut dbg) = self.debugger.take() {
            dbg.poll(self);
            self.restore_debugger(dbg);
        }
    }

    /// Block until a debugger client has authenticated and released the
    /// session with `CONTINUE`, when the debugger is configured to wait.
    pub fn wait_for_debugger(&mut self) {
        if let Some(mut dbg) = self.debugger.take() {
            dbg.wait_for_client(self);
            self.restore_debugger(dbg);
        }
    }

    fn restore_debugger(&mut self, dbg: TelnetDebugger) {
        if self.debugger.is_none() {
            self.debugger = Some(dbg);
        }
    }

    /// Stack trace, innermost frame first.
    pub fn stack_trace(&self) -> Vec<FrameInfo> {
        self.frames
            .iter()
            .rev()
            .map(|frame| {
                let file = match frame.block.name() {
                    "" => "<none>".to_string(),
                    name => name.to_string(),
                };
                let scope = frame
                    .function
                    .as_ref()
                    .map_or_else(|| "<none>".to_string(), |f| f.qualified_name());
                FrameInfo {
                    file,
                    line: frame.block.line_for_ip(frame.ip),
                    scope,
                }
            })
            .collect()
    }

    // ========================================
    // Compile and load
    // ========================================

    /// Compile `source` and run it immediately.
    pub fn compile_exec(&mut self, name: &str, source: &str) -> Result<String, ConsoleError> {
        self.compile_exec_with(name, source, ExecOptions::default())
    }

    pub fn compile_exec_with(
        &mut self,
        name: &str,
        source: &str,
        options: ExecOptions,
    ) -> Result<String, ConsoleError> {
        let ast = compiler::parse(name, source)?;
        if ast.is_empty() {
            debug!(name, "nothing to execute");
            return Ok(String::new());
        }
        let unit = compiler::generate(name, &ast, IdentMode::Resolved(&mut self.symbols))?;
        self.stats.blocks_compiled += 1;
        let block = Rc::new(CodeBlock::new(name, unit));
        self.register_block(&block);

        let frame = match options.frame {
            Some(from_top) if !self.frames.is_empty() => {
                let from_top = from_top.min(self.frames.len() - 1);
                Some(self.frames.len() - 1 - from_top)
            }
            _ => None,
        };
        let result = self.exec(&block, 0, None, frame, options.no_calls)?;
        Ok(result.into_console_string())
    }

    /// Evaluate an anonymous snippet.
    pub fn eval(&mut self, source: &str) -> Result<String, ConsoleError> {
        self.compile_exec("", source)
    }

    /// Evaluate an anonymous snippet inside the frame `from_top` levels
    /// below the innermost one.
    pub fn eval_in_frame(&mut self, source: &str, from_top: usize) -> Result<String, ConsoleError> {
        self.compile_exec_with(
            "",
            source,
            ExecOptions {
                no_calls: false,
                frame: Some(from_top),
            },
        )
    }

    /// Path of the compiled cache for `script`.
    pub fn dso_path(&self, script: &Path) -> PathBuf {
        compiler::dso_path(script, &self.config.dso_extension)
    }

    /// Execute a script file, preferring an up-to-date DSO.
    pub fn exec_file(&mut self, path: &Path) -> Result<String, ConsoleError> {
        let name = path.to_string_lossy().into_owned();
        let dso = self.dso_path(path);

        if compiler::dso_is_current(path, &dso) {
            match self.load_dso(&dso, &name) {
                Ok(block) => return self.run_block(block),
                Err(e) => warn!(dso = %dso.display(), error = %e, "ignoring unreadable DSO"),
            }
        }

        let source = fs::read_to_string(path).map_err(|source| ConsoleError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        if !self.config.write_dso {
            return self.compile_exec(&name, &source);
        }

        let ast = compiler::parse(&name, &source)?;
        if ast.is_empty() {
            return Ok(String::new());
        }
        let unit = compiler::generate(&name, &ast, IdentMode::Deferred)?;
        self.stats.blocks_compiled += 1;
        let bytes = bytecode::serialize(&unit);
        match fs::write(&dso, &bytes) {
            Ok(()) => debug!(dso = %dso.display(), "wrote DSO"),
            Err(e) => warn!(dso = %dso.display(), error = %e, "could not write DSO"),
        }
        let block = bytecode::read_dso(&mut Cursor::new(bytes), &name, &mut self.symbols)?;
        self.run_block(Rc::new(block))
    }

    /// Load a DSO from disk without running it.
    pub fn load_dso(&mut self, path: &Path, name: &str) -> Result<Rc<CodeBlock>, ConsoleError> {
        let bytes = fs::read(path).map_err(|source| ConsoleError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        self.load_dso_bytes(&bytes, name)
    }

    /// Load an in-memory DSO image without running it.
    pub fn load_dso_bytes(&mut self, bytes: &[u8], name: &str) -> Result<Rc<CodeBlock>, ConsoleError> {
        let block = bytecode::read_dso(&mut Cursor::new(bytes), name, &mut self.symbols)?;
        Ok(Rc::new(block))
    }

    /// Register and run a loaded block from its first instruction.
    pub fn run_block(&mut self, block: Rc<CodeBlock>) -> Result<String, ConsoleError> {
        self.register_block(&block);
        let result = self.exec(&block, 0, None, None, false)?;
        Ok(result.into_console_string())
    }

    fn register_block(&mut self, block: &Rc<CodeBlock>) {
        if block.name().is_empty() {
            return;
        }
        self.blocks.insert(block.clone());
        if let Some(mut dbg) = self.debugger.take() {
            dbg.on_block_loaded(block);
            self.restore_debugger(dbg);
        }
    }

    // ========================================
    // Calls
    // ========================================

    /// Call a global function by name.
    pub fn call_function(&mut self, name: &str, args: &[&str]) -> Result<String, ConsoleError> {
        let argv = args.iter().map(|a| Value::from(*a)).collect();
        let callee = self.resolve_named(None, name, argv)?;
        let result = self.finish_call(callee)?;
        Ok(result.into_console_string())
    }

    fn resolve_named(&mut self, namespace: Option<&str>, name: &str, argv: Vec<Value>) -> Result<Callee, ExecError> {
        if let Some(function) = self.namespaces.lookup(namespace, name) {
            return Ok(Callee::Script(function, argv));
        }
        if namespace.is_none() {
            if let Some(builtin) = builtins::find(name) {
                let args: Vec<String> = argv.into_iter().map(Value::into_console_string).collect();
                return builtin(self, &args).map(Callee::Done);
            }
        } else if let Some(method) = builtins::find_method(name) {
            // `SimObject::getId(%obj)` style calls reach the builtin methods.
            if let Some(id) = argv.first().and_then(|v| self.objects.find(&v.to_console_string())) {
                let args: Vec<String> = argv.into_iter().skip(1).map(Value::into_console_string).collect();
                return method(self, id, &args).map(Callee::Done);
            }
        }
        match namespace {
            Some(ns) => warn!("Unable to find function {ns}::{name}"),
            None => warn!("Unable to find function {name}"),
        }
        Ok(Callee::Done(Value::empty()))
    }

    fn resolve_method(&mut self, name: &str, mut argv: Vec<Value>) -> Result<Callee, ExecError> {
        let Some(target) = argv.first().map(Value::to_console_string) else {
            warn!(method = name, "method call without an object");
            return Ok(Callee::Done(Value::empty()));
        };
        let Some(id) = self.objects.find(&target) else {
            warn!("Unable to find object: '{target}' attempting to call function '{name}'");
            return Ok(Callee::Done(Value::empty()));
        };
        argv[0] = Value::Str(id.to_string());
        let start = self.object_namespace(id);
        if let Some(function) = start.and_then(|ns| self.namespaces.lookup_in_chain(&ns, name)) {
            return Ok(Callee::Script(function, argv));
        }
        if let Some(method) = builtins::find_method(name) {
            let args: Vec<String> = argv.into_iter().skip(1).map(Value::into_console_string).collect();
            return method(self, id, &args).map(Callee::Done);
        }
        warn!("{target}: Unknown command {name}.");
        Ok(Callee::Done(Value::empty()))
    }

    fn resolve_parent(&mut self, frame: usize, name: &str, argv: Vec<Value>) -> Result<Callee, ExecError> {
        let namespace = self.frames[frame]
            .function
            .as_ref()
            .and_then(|f| f.namespace.clone());
        let Some(namespace) = namespace else {
            warn!(function = name, "Parent:: call outside of a namespaced function");
            return Ok(Callee::Done(Value::empty()));
        };
        let parent = self.namespaces.parent(&namespace).map(str::to_string);
        if let Some(function) = parent.and_then(|p| self.namespaces.lookup_in_chain(&p, name)) {
            return Ok(Callee::Script(function, argv));
        }
        if let Some(method) = builtins::find_method(name) {
            if let Some(id) = argv.first().and_then(|v| self.objects.find(&v.to_console_string())) {
                let args: Vec<String> = argv.into_iter().skip(1).map(Value::into_console_string).collect();
                return method(self, id, &args).map(Callee::Done);
            }
        }
        warn!("Unable to find parent function {namespace}::{name}");
        Ok(Callee::Done(Value::empty()))
    }

    /// First namespace searched for an object's methods.
    fn object_namespace(&self, id: u32) -> Option<String> {
        let obj = self.objects.get(id)?;
        Some(obj.name.clone().unwrap_or_else(|| obj.class.to_string()))
    }

    /// Run a resolved call to completion in a fresh interpreter loop.
    fn finish_call(&mut self, callee: Callee) -> Result<Value, ExecError> {
        match callee {
            Callee::Script(function, argv) => {
                let block = function.block.clone();
                let body = function.body_ip;
                self.exec(&block, body, Some((function, argv)), None, false)
            }
            Callee::Done(value) => Ok(value),
        }
    }

    // ========================================
    // Interpreter
    // ========================================

    /// Push a script frame, binding `call`'s arguments to the declared names.
    fn push_frame(
        &mut self,
        block: &Rc<CodeBlock>,
        start_ip: u32,
        call: Option<(Rc<ScriptFunction>, Vec<Value>)>,
    ) -> Result<usize, ExecError> {
        if self.frames.len() >= self.config.max_call_depth {
            return Err(ExecError::StackOverflow {
                limit: self.config.max_call_depth,
            });
        }
        let mut locals = HashMap::new();
        let function = call.map(|(function, argv)| {
            self.stats.calls += 1;
            let mut argv = argv.into_iter();
            for arg in &function.args {
                let value = argv.next().unwrap_or_default();
                if let Some(sym) = arg {
                    locals.insert(self.symbols.resolve(*sym).to_ascii_lowercase(), value);
                }
            }
            function
        });
        self.frames.push(Frame {
            block: block.clone(),
            ip: start_ip,
            function,
            locals,
        });
        Ok(self.frames.len() - 1)
    }

    fn exec(
        &mut self,
        block: &Rc<CodeBlock>,
        start_ip: u32,
        call: Option<(Rc<ScriptFunction>, Vec<Value>)>,
        frame: Option<usize>,
        no_calls: bool,
    ) -> Result<Value, ExecError> {
        let in_function = call.is_some();
        let owns_frame = frame.is_none();
        let base = self.frames.len();
        let frame = match frame {
            Some(index) => index,
            None => self.push_frame(block, start_ip, call)?,
        };

        let act = Activation {
            block: block.clone(),
            frame,
            in_function,
            no_calls,
            owns_frame,
        };
        let result = self.run(act, start_ip);
        // Nested script calls leave their frames behind when they fail.
        self.frames.truncate(base);
        result
    }

    /// Interpreter loop. Script-to-script calls park the caller on
    /// `callers` and continue in the same loop, so call depth is bounded by
    /// `max_call_depth` rather than the native stack.
    fn run(&mut self, mut act: Activation, start_ip: u32) -> Result<Value, ExecError> {
        let mut state = ExecState::default();
        let mut callers: Vec<Suspended> = Vec::new();
        let mut ip = start_ip;

        loop {
            let block = &act.block;
            let mut inst = block.decode(ip)?;
            if inst == Instruction::Break {
                inst = self.on_break(&act, ip)?;
            }
            self.stats.instructions += 1;
            if self.config.trace_exec {
                trace!(block = block.name(), ip, op = inst.opcode().name(), depth = state.stack.len(), "exec");
            }
            let next = ip + inst.size() as u32;

            match inst {
                Instruction::FuncDecl {
                    name,
                    namespace,
                    has_body,
                    line,
                    end_ip,
                    args,
                } => {
                    if let (Some(name), true) = (name, has_body) {
                        self.namespaces.define(ScriptFunction {
                            name: self.symbols.resolve(name).to_string(),
                            namespace: namespace.map(|ns| self.symbols.resolve(ns).to_string()),
                            block: block.clone(),
                            body_ip: next,
                            args,
                            line,
                        });
                    }
                    ip = end_ip;
                    continue;
                }
                Instruction::CreateObject { fail } => {
                    let args = state.arg_frames.pop().ok_or(ExecError::StackUnderflow { ip })?;
                    let mut args = args.into_iter().map(Value::into_console_string);
                    let class = args.next().unwrap_or_default();
                    let name = args.next().unwrap_or_default();
                    match self.objects.create(&class, Some(name.as_str())) {
                        Some(id) => {
                            if !name.is_empty() {
                                if let Some(class) = self.objects.get(id).map(|o| o.class) {
                                    self.namespaces.link(&name, class);
                                }
                            }
                            debug!(id, class = %class, name = %name, "created object");
                            state.new_objects.push(id);
                        }
                        None => {
                            warn!("Unable to instantiate non-conobject class {class}.");
                            state.push(Value::Uint(0));
                            ip = fail;
                            continue;
                        }
                    }
                }
                Instruction::AddObject { place_at_root } => {
                    let id = *state.new_objects.last().ok_or(ExecError::StackUnderflow { ip })?;
                    if !place_at_root {
                        if let Some(&parent) = state.new_objects.iter().rev().nth(1) {
                            if !self.objects.add_child(parent, id) {
                                warn!(parent, child = id, "object is not a group; child left unparented");
                            }
                        }
                    }
                    let callback = self
                        .object_namespace(id)
                        .and_then(|ns| self.namespaces.lookup_in_chain(&ns, "onAdd"));
                    if let Some(function) = callback {
                        self.finish_call(Callee::Script(function, vec![Value::Str(id.to_string())]))?;
                    }
                }
                Instruction::EndObject { .. } => {
                    let id = state.new_objects.pop().ok_or(ExecError::StackUnderflow { ip })?;
                    state.push(Value::Uint(id));
                }

                Instruction::JmpIffNot(t) => {
                    if state.pop(ip)?.to_float() == 0.0 {
                        ip = t;
                        continue;
                    }
                }
                Instruction::JmpIfNot(t) => {
                    if state.pop(ip)?.to_uint() == 0 {
                        ip = t;
                        continue;
                    }
                }
                Instruction::JmpIff(t) => {
                    if state.pop(ip)?.to_float() != 0.0 {
                        ip = t;
                        continue;
                    }
                }
                Instruction::JmpIf(t) => {
                    if state.pop(ip)?.to_uint() != 0 {
                        ip = t;
                        continue;
                    }
                }
                Instruction::JmpIfNotNp(t) => {
                    if state.top(ip)?.to_uint() == 0 {
                        ip = t;
                        continue;
                    }
                    state.pop(ip)?;
                }
                Instruction::JmpIfNp(t) => {
                    if state.top(ip)?.to_uint() != 0 {
                        ip = t;
                        continue;
                    }
                    state.pop(ip)?;
                }
                Instruction::Jmp(t) => {
                    ip = t;
                    continue;
                }
                Instruction::Return | Instruction::ReturnVoid => {
                    let value = match inst {
                        Instruction::Return => Value::Str(state.pop(ip)?.into_console_string()),
                        _ => Value::empty(),
                    };
                    let Some(caller) = callers.pop() else {
                        return Ok(value);
                    };
                    self.frames.pop();
                    act = caller.act;
                    state = caller.state;
                    ip = caller.resume_ip;
                    state.push(value);
                    continue;
                }

                Instruction::CmpEq
                | Instruction::CmpGr
                | Instruction::CmpGe
                | Instruction::CmpLt
                | Instruction::CmpLe
                | Instruction::CmpNe => {
                    let a = state.pop(ip)?.to_float();
                    let b = state.pop(ip)?.to_float();
                    let result = match inst {
                        Instruction::CmpEq => a == b,
                        Instruction::CmpGr => a > b,
                        Instruction::CmpGe => a >= b,
                        Instruction::CmpLt => a < b,
                        Instruction::CmpLe => a <= b,
                        _ => a != b,
                    };
                    state.push(Value::Uint(result as u32));
                }
                Instruction::Xor
                | Instruction::Mod
                | Instruction::BitAnd
                | Instruction::BitOr
                | Instruction::Shr
                | Instruction::Shl => {
                    let a = state.pop(ip)?.to_uint();
                    let b = state.pop(ip)?.to_uint();
                    let result = match inst {
                        Instruction::Xor => a ^ b,
                        Instruction::Mod => {
                            if b == 0 {
                                0
                            } else {
                                (a as i32).wrapping_rem(b as i32) as u32
                            }
                        }
                        Instruction::BitAnd => a & b,
                        Instruction::BitOr => a | b,
                        Instruction::Shr => a.wrapping_shr(b),
                        _ => a.wrapping_shl(b),
                    };
                    state.push(Value::Uint(result));
                }
                Instruction::Not => {
                    let v = state.pop(ip)?.to_uint();
                    state.push(Value::Uint((v == 0) as u32));
                }
                Instruction::NotF => {
                    let v = state.pop(ip)?.to_float();
                    state.push(Value::Uint((v == 0.0) as u32));
                }
                Instruction::OnesComplement => {
                    let v = state.pop(ip)?.to_uint();
                    state.push(Value::Uint(!v));
                }
                Instruction::Add | Instruction::Sub | Instruction::Mul | Instruction::Div => {
                    let a = state.pop(ip)?.to_float();
                    let b = state.pop(ip)?.to_float();
                    let result = match inst {
                        Instruction::Add => a + b,
                        Instruction::Sub => a - b,
                        Instruction::Mul => a * b,
                        _ => a / b,
                    };
                    state.push(Value::Float(result));
                }
                Instruction::Neg => {
                    let v = state.pop(ip)?.to_float();
                    state.push(Value::Float(-v));
                }

                Instruction::SetCurVar(sym) | Instruction::SetCurVarCreate(sym) => {
                    state.cur_var = sym.map(|s| self.symbols.resolve(s).to_ascii_lowercase());
                }
                Instruction::SetCurVarArray | Instruction::SetCurVarArrayCreate => {
                    let name = state.pop(ip)?.into_console_string();
                    state.cur_var = Some(name.to_ascii_lowercase());
                }
                Instruction::LoadVar(kind) => {
                    let value = match &state.cur_var {
                        Some(key) => self.load_var(act.frame, key),
                        None => Value::empty(),
                    };
                    state.push(coerce(value, kind));
                }
                Instruction::SaveVar(kind) => {
                    let value = coerce(state.top(ip)?.clone(), kind);
                    if let Some(key) = state.cur_var.clone() {
                        self.save_var(act.frame, key, value);
                    }
                }

                Instruction::SetCurObject => {
                    let reference = state.pop(ip)?.into_console_string();
                    state.cur_object = self.objects.find(&reference);
                    if state.cur_object.is_none() && !reference.is_empty() {
                        warn!("Unable to find object: '{reference}'");
                    }
                }
                Instruction::SetCurObjectNew => {
                    state.cur_object = state.new_objects.last().copied();
                }
                Instruction::SetCurField(sym) => {
                    state.cur_field = sym.map(|s| self.symbols.resolve(s).to_string());
                }
                Instruction::SetCurFieldArray => {
                    let index = state.pop(ip)?.into_console_string();
                    if let Some(field) = &mut state.cur_field {
                        field.push_str(&index);
                    }
                }
                Instruction::LoadField(kind) => {
                    let value = match (state.cur_object, &state.cur_field) {
                        (Some(id), Some(field)) => self
                            .objects
                            .get(id)
                            .and_then(|o| o.field(field))
                            .map_or_else(Value::empty, Value::from),
                        _ => Value::empty(),
                    };
                    state.push(coerce(value, kind));
                }
                Instruction::SaveField(kind) => {
                    let value = coerce(state.top(ip)?.clone(), kind);
                    if let (Some(id), Some(field)) = (state.cur_object, &state.cur_field) {
                        if let Some(obj) = self.objects.get_mut(id) {
                            obj.set_field(field, value.into_console_string());
                        }
                    }
                }

                Instruction::StrToUint | Instruction::FltToUint => {
                    let v = state.pop(ip)?;
                    state.push(Value::Uint(v.to_uint()));
                }
                Instruction::StrToFlt | Instruction::UintToFlt => {
                    let v = state.pop(ip)?;
                    state.push(Value::Float(v.to_float()));
                }
                Instruction::FltToStr | Instruction::UintToStr => {
                    let v = state.pop(ip)?;
                    state.push(Value::Str(v.into_console_string()));
                }
                Instruction::StrToNone | Instruction::FltToNone | Instruction::UintToNone => {
                    state.pop(ip)?;
                }

                Instruction::LoadImmedUint(v) => state.push(Value::Uint(v)),
                Instruction::LoadImmedFlt(index) => {
                    let v = block
                        .float_at(index, act.in_function)
                        .ok_or(ExecError::BadConstant { ip, index })?;
                    state.push(Value::Float(v));
                }
                Instruction::TagToStr(offset) => {
                    let tag = self.tagged_strings.len() as u32 + 1;
                    match block.rewrite_tag(ip, offset, act.in_function, tag) {
                        Some((original, tagged)) => {
                            self.tagged_strings.push(original);
                            state.push(Value::Str(tagged));
                        }
                        // Too short to patch in place: tag it on every run.
                        None => {
                            let s = block
                                .string_at(offset, act.in_function)
                                .ok_or(ExecError::BadConstant { ip, index: offset })?;
                            self.tagged_strings.push(s);
                            state.push(Value::Str(format!("\x01{tag}")));
                        }
                    }
                }
                Instruction::LoadImmedStr(offset) => {
                    let s = block
                        .string_at(offset, act.in_function)
                        .ok_or(ExecError::BadConstant { ip, index: offset })?;
                    state.push(Value::Str(s));
                }
                Instruction::LoadImmedIdent(sym) => {
                    let s = sym.map(|s| self.symbols.resolve(s).to_string()).unwrap_or_default();
                    state.push(Value::Str(s));
                }

                Instruction::CallFunc {
                    name,
                    namespace,
                    call_type,
                } => {
                    let argv = state.arg_frames.pop().ok_or(ExecError::StackUnderflow { ip })?;
                    if act.no_calls {
                        state.push(Value::empty());
                    } else {
                        if act.owns_frame {
                            self.frames[act.frame].ip = ip;
                        }
                        match self.dispatch_call(act.frame, name, namespace, call_type, argv)? {
                            Callee::Script(function, argv) => {
                                let callee_block = function.block.clone();
                                let body = function.body_ip;
                                let frame = self.push_frame(&callee_block, body, Some((function, argv)))?;
                                let callee = Activation {
                                    block: callee_block,
                                    frame,
                                    in_function: true,
                                    no_calls: false,
                                    owns_frame: true,
                                };
                                callers.push(Suspended {
                                    act: std::mem::replace(&mut act, callee),
                                    state: std::mem::take(&mut state),
                                    resume_ip: next,
                                });
                                ip = body;
                                continue;
                            }
                            Callee::Done(result) => state.push(Value::Str(result.into_console_string())),
                        }
                    }
                }
                Instruction::Concat => {
                    let a = state.pop(ip)?.into_console_string();
                    let b = state.pop(ip)?.into_console_string();
                    state.push(Value::Str(a + &b));
                }
                Instruction::ConcatChar(c) => {
                    let mut a = state.pop(ip)?.into_console_string();
                    let b = state.pop(ip)?.into_console_string();
                    a.push(c as char);
                    a.push_str(&b);
                    state.push(Value::Str(a));
                }
                Instruction::CompareStr => {
                    let a = state.pop(ip)?.into_console_string();
                    let b = state.pop(ip)?.into_console_string();
                    state.push(Value::Uint(a.eq_ignore_ascii_case(&b) as u32));
                }
                Instruction::PushFrame => state.arg_frames.push(Vec::new()),
                Instruction::Push => {
                    let v = state.pop(ip)?;
                    state
                        .arg_frames
                        .last_mut()
                        .ok_or(ExecError::StackUnderflow { ip })?
                        .push(v);
                }

                Instruction::IterBegin { var, fail } | Instruction::IterBeginStr { var, fail } => {
                    let container = state.pop(ip)?.into_console_string();
                    let items = if matches!(inst, Instruction::IterBeginStr { .. }) {
                        Some(IterItems::Words(
                            container.split([' ', '\t', '\n']).filter(|w| !w.is_empty()).map(str::to_string).collect(),
                        ))
                    } else {
                        match self.objects.find(&container) {
                            Some(id) if self.objects.is_group(id) => self
                                .objects
                                .get(id)
                                .map(|o| IterItems::Objects(o.children.clone())),
                            _ => {
                                warn!("foreach: '{container}' is not a set");
                                None
                            }
                        }
                    };
                    match items {
                        Some(items) => state.iters.push(IterState {
                            var: var
                                .map(|v| self.symbols.resolve(v).to_ascii_lowercase())
                                .unwrap_or_default(),
                            items,
                            next: 0,
                        }),
                        None => {
                            ip = fail;
                            continue;
                        }
                    }
                }
                Instruction::Iter { exit } => {
                    let iter = state.iters.last_mut().ok_or(ExecError::StackUnderflow { ip })?;
                    let item = match &iter.items {
                        IterItems::Objects(ids) => ids.get(iter.next).map(|&id| Value::Uint(id)),
                        IterItems::Words(words) => words.get(iter.next).cloned().map(Value::Str),
                    };
                    match item {
                        Some(value) => {
                            iter.next += 1;
                            let key = iter.var.clone();
                            self.save_var(act.frame, key, value);
                        }
                        None => {
                            ip = exit;
                            continue;
                        }
                    }
                }
                Instruction::IterEnd => {
                    state.iters.pop();
                }

                // `on_break` replaced every BREAK with the instruction it covers.
                Instruction::Break => return Err(ExecError::MissingBreakLine { ip }),
            }
            ip = next;
        }
    }

    fn dispatch_call(
        &mut self,
        frame: usize,
        name: Option<SymbolId>,
        namespace: Option<SymbolId>,
        call_type: CallType,
        argv: Vec<Value>,
    ) -> Result<Callee, ExecError> {
        let Some(name) = name.map(|s| self.symbols.resolve(s).to_string()) else {
            warn!("call to an unnamed function");
            return Ok(Callee::Done(Value::empty()));
        };
        match call_type {
            CallType::Function => {
                let namespace = namespace.map(|s| self.symbols.resolve(s).to_string());
                self.resolve_named(namespace.as_deref(), &name, argv)
            }
            CallType::Method => self.resolve_method(&name, argv),
            CallType::Parent => self.resolve_parent(frame, &name, argv),
        }
    }

    /// Report a breakpoint hit and return the instruction the BREAK covers.
    fn on_break(&mut self, act: &Activation, ip: u32) -> Result<Instruction, ExecError> {
        let opcode = act
            .block
            .break_opcode(ip)
            .ok_or(ExecError::MissingBreakLine { ip })?;
        if act.owns_frame {
            self.frames[act.frame].ip = ip;
        }
        if let Some(mut dbg) = self.debugger.take() {
            let line = act.block.line_for_ip(ip);
            dbg.execution_stopped(self, &act.block, line);
            self.restore_debugger(dbg);
        }
        Ok(act.block.decode_as(ip, opcode)?)
    }

    fn load_var(&self, frame: usize, key: &str) -> Value {
        let value = if key.starts_with('$') {
            self.globals.get(key)
        } else {
            self.frames.get(frame).and_then(|f| f.locals.get(key))
        };
        value.cloned().unwrap_or_default()
    }

    fn save_var(&mut self, frame: usize, key: String, value: Value) {
        if key.starts_with('$') {
            self.globals.insert(key, value);
        } else if let Some(f) = self.frames.get_mut(frame) {
            f.locals.insert(key, value);
        }
    }
}

fn coerce(value: Value, kind: Kind) -> Value {
    match kind {
        Kind::Uint => Value::Uint(value.to_uint()),
        Kind::Float => Value::Float(value.to_float()),
        Kind::Str => Value::Str(value.into_console_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::RefCell;

    /// Output sink the test can read back.
    #[derive(Clone, Default)]
    struct Capture(Rc<RefCell<Vec<u8>>>);

    impl Write for Capture {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            self.0.borrow_mut().extend_from_slice(buf);
            Ok(buf.len())
        }
        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    impl Capture {
        fn text(&self) -> String {
            String::from_utf8_lossy(&self.0.borrow()).into_owned()
        }
    }

    fn run(source: &str) -> (VM, String) {
        let capture = Capture::default();
        let mut vm = VM::with_output(Box::new(capture.clone()));
        vm.compile_exec("test.cs", source).unwrap();
        (vm, capture.text())
    }

    #[test]
    fn test_arithmetic_and_globals() {
        let (vm, _) = run("$a = 1 + 2 * 3; $b = 10 - 4; $c = 7 % 3; $d = 2 / 4;");
        let text = |name| vm.global(name).map(Value::to_console_string);
        assert_eq!(text("a").as_deref(), Some("7"));
        assert_eq!(text("$B").as_deref(), Some("6"));
        assert_eq!(text("c").as_deref(), Some("1"));
        assert_eq!(text("d").as_deref(), Some("0.5"));
        assert_eq!(vm.global("missing"), None);
    }

    #[test]
    fn test_echo_and_concat() {
        let (_, out) = run("echo(\"a\" @ \"b\" SPC 1 TAB 2.5);");
        assert_eq!(out, "ab 1\t2.5\n");
    }

    #[test]
    fn test_expression_statement_without_result() {
        let capture = Capture::default();
        let mut vm = VM::with_output(Box::new(capture.clone()));
        assert_eq!(vm.compile_exec("", "1 + 2;").unwrap(), "");
        assert!(vm.blocks().is_empty());
        assert!(capture.text().is_empty());
    }

    #[test]
    fn test_blank_source_is_not_registered() {
        let mut vm = VM::with_output(Box::new(io::sink()));
        assert_eq!(vm.compile_exec("blank.cs", "   \n // comment only\n").unwrap(), "");
        assert!(vm.blocks().find("blank.cs").is_none());
        assert_eq!(vm.stats().blocks_compiled, 0);
    }

    #[test]
    fn test_functions_and_recursion() {
        let (_, out) = run(
            "function fib(%n) { if (%n < 2) return %n; return fib(%n - 1) + fib(%n - 2); }\n\
             echo(fib(10));",
        );
        assert_eq!(out, "55\n");
    }

    #[test]
    fn test_missing_args_are_empty() {
        let (_, out) = run("function f(%a, %b) { return %a @ \"|\" @ %b; } echo(f(1));");
        assert_eq!(out, "1|\n");
    }

    #[test]
    fn test_loops_break_continue() {
        let (_, out) = run(
            "for (%i = 0; %i < 10; %i++) { if (%i == 2) continue; if (%i == 5) break; echo(%i); }\n\
             %n = 3; while (%n > 0) { echo(\"n\" @ %n); %n--; }\n\
             do { echo(\"once\"); } while (false);",
        );
        assert_eq!(out, "0\n1\n3\n4\nn3\nn2\nn1\nonce\n");
    }

    #[test]
    fn test_logical_short_circuit() {
        let (_, out) = run(
            "function side(%v) { echo(\"side\" @ %v); return %v; }\n\
             if (0 && side(1)) echo(\"no\"); if (1 || side(2)) echo(\"yes\");\n\
             echo(side(1) && side(0));",
        );
        assert_eq!(out, "yes\nside1\nside0\n0\n");
    }

    #[test]
    fn test_arrays_and_string_compare() {
        let (_, out) = run(
            "%a[1, 2] = \"x\"; echo(%a1_2); $g[\"k\"] = 5; echo($gk);\n\
             echo(\"ABC\" $= \"abc\"); echo(\"a\" !$= \"a\");",
        );
        assert_eq!(out, "x\n5\n1\n0\n");
    }

    #[test]
    fn test_objects_fields_and_methods() {
        let (vm, out) = run(
            "new ScriptObject(Hero) { hp = 10; tags[0] = \"a\"; };\n\
             function Hero::heal(%this, %n) { %this.hp += %n; return %this.hp; }\n\
             echo(Hero.heal(5)); echo(Hero.tags0); echo(Hero.getName());\n\
             echo(Hero.getClassName() SPC Hero.getId());",
        );
        assert_eq!(out, "15\na\nHero\nScriptObject 2000\n");
        assert!(vm.objects().find("hero").is_some());
    }

    #[test]
    fn test_parent_call_walks_class_chain() {
        let (_, out) = run(
            "function ScriptObject::describe(%this) { return \"base\"; }\n\
             function Thing::describe(%this) { return \"thing:\" @ Parent::describe(%this); }\n\
             new ScriptObject(Thing);\n\
             echo(Thing.describe());",
        );
        assert_eq!(out, "thing:base\n");
    }

    #[test]
    fn test_nested_objects_and_foreach() {
        let (_, out) = run(
            "%g = new SimGroup(Bag) { new ScriptObject(A); new ScriptObject(B) { v = 2; }; };\n\
             foreach (%o in Bag) echo(%o.getName());\n\
             foreach$ (%w in \"x  y\tz\") echo(%w);\n\
             echo(Bag.getCount());",
        );
        assert_eq!(out, "A\nB\nx\ny\nz\n2\n");
    }

    #[test]
    fn test_unknown_class_fails_gracefully() {
        let (_, out) = run("%o = new NoSuchClass(X) { a = 1; }; echo(\"[\" @ %o @ \"]\");");
        assert_eq!(out, "[0]\n");
    }

    #[test]
    fn test_unknown_function_is_empty() {
        let (_, out) = run("echo(\"<\" @ nope(1) @ \">\");");
        assert_eq!(out, "<>\n");
    }

    #[test]
    fn test_switch() {
        let (_, out) = run(
            "function pick(%v) { switch$ (%v) { case \"a\" or \"b\": return 1; case \"c\": return 2; default: return 3; } }\n\
             echo(pick(\"B\") @ pick(\"c\") @ pick(\"z\"));\n\
             switch (2) { case 1: echo(\"one\"); case 2: echo(\"two\"); }",
        );
        assert_eq!(out, "123\ntwo\n");
    }

    #[test]
    fn test_tagged_strings() {
        let (vm, out) = run("function t() { return 'hello'; } %a = t(); %b = t(); echo(%a $= %b); echo(getTaggedString(%a));");
        assert_eq!(out, "1\nhello\n");
        assert_eq!(vm.tagged_string(1), Some("hello"));
    }

    #[test]
    fn test_call_depth_limit() {
        let config = RuntimeConfig {
            max_call_depth: 32,
            ..RuntimeConfig::default()
        };
        let mut vm = VM::with_config(config, Box::new(io::sink()));
        let err = vm
            .compile_exec("deep.cs", "function down(%n) { return down(%n + 1); } down(0);")
            .unwrap_err();
        assert!(matches!(err, ConsoleError::Exec(ExecError::StackOverflow { limit: 32 })));
        assert_eq!(vm.call_depth(), 0);
    }

    #[test]
    fn test_default_depth_recursion_stays_off_native_stack() {
        let mut vm = VM::with_output(Box::new(io::sink()));
        let source = "function down(%n) { if (%n >= 1000) return %n; return down(%n + 1); } return down(0);";
        assert_eq!(vm.compile_exec("down.cs", source).unwrap(), "1000");
        assert_eq!(vm.call_depth(), 0);

        let err = vm
            .compile_exec("forever.cs", "function spin(%n) { return spin(%n + 1); } spin(0);")
            .unwrap_err();
        assert!(matches!(err, ConsoleError::Exec(ExecError::StackOverflow { limit: 1024 })));
        assert_eq!(vm.call_depth(), 0);
    }

    #[test]
    fn test_caller_state_survives_nested_calls() {
        let (_, out) = run(
            "function fib(%n) { if (%n < 2) return %n; return fib(%n - 1) + fib(%n - 2); }\n\
             function wrap(%x) { %keep = %x; %r = fib(10); return %keep @ \":\" @ %r; }\n\
             echo(wrap(\"k\") SPC fib(15));",
        );
        assert_eq!(out, "k:55 610\n");
    }

    #[test]
    fn test_no_calls_skips_top_level_calls() {
        let capture = Capture::default();
        let mut vm = VM::with_output(Box::new(capture.clone()));
        let options = ExecOptions {
            no_calls: true,
            frame: None,
        };
        vm.compile_exec_with("nc.cs", "function f() { echo(\"ran\"); } f(); $x = 1;", options)
            .unwrap();
        assert!(capture.text().is_empty());
        assert_eq!(vm.global("x").map(Value::to_console_string).as_deref(), Some("1"));
        assert_eq!(vm.call_function("f", &[]).unwrap(), "");
        assert_eq!(capture.text(), "ran\n");
    }

    #[test]
    fn test_exec_file_writes_and_prefers_dso() {
        let dir = tempfile::tempdir().unwrap();
        let script = dir.path().join("main.cs");
        fs::write(&script, "function hi() { return \"hi\"; } echo(hi());").unwrap();

        let capture = Capture::default();
        let mut vm = VM::with_output(Box::new(capture.clone()));
        vm.exec_file(&script).unwrap();
        let dso = vm.dso_path(&script);
        assert!(dso.exists());

        // Second run loads the cache even with the source gone.
        fs::remove_file(&script).unwrap();
        vm.exec_file(&script).unwrap();
        assert_eq!(capture.text(), "hi\nhi\n");
    }

    #[test]
    fn test_frames_unwind_after_run() {
        let (vm, _) = run("function f() { return 1; } f();");
        assert!(vm.stack_trace().is_empty());
        assert_eq!(vm.call_depth(), 0);
        assert_eq!(vm.stats().calls, 1);
    }

    #[test]
    fn test_set_global_visible_to_script() {
        let capture = Capture::default();
        let mut vm = VM::with_output(Box::new(capture.clone()));
        vm.set_global("Pref::Name", "bob");
        vm.compile_exec("g.cs", "echo($pref::name);").unwrap();
        assert_eq!(capture.text(), "bob\n");
    }
}
