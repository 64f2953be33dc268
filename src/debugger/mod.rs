//! Telnet debugger.
//!
//! A line protocol for remote control of the interpreter: set and clear
//! breakpoints, step, inspect the call stack and evaluate expressions inside a
//! paused frame. The [`TelnetDebugger`] is driven from the interpreter's
//! thread: between executions through [`VM::poll_debugger`], and while paused
//! at a `BREAK` by its own polling loop.

mod link;
mod server;

use std::rc::Rc;
use std::sync::mpsc::TryRecvError;
use std::thread;

use tracing::{debug, info, warn};

use crate::config::DebuggerConfig;
use crate::vm::codeblock::CodeBlock;
use crate::vm::vm::VM;

pub use link::{ConsoleTap, DebugLink, DebugPeer, LinkEvent, Outgoing};
pub use server::{ServerHandle, spawn_server};

/// Global the breakpoint condition is evaluated into.
const CONDITION_VAR: &str = "$Debug::result";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum State {
    NotConnected,
    /// Connected; the next line is the password.
    PasswordTry,
    /// Authenticated while startup waits for `CONTINUE`.
    Initialize,
    Connected,
}

#[derive(Debug, Clone)]
struct Breakpoint {
    file: String,
    line: u32,
    clear_on_hit: bool,
    pass_count: u32,
    cur_count: u32,
    condition: String,
}

/// Stop at the next statement run at or above this call depth.
#[derive(Debug, Clone, Copy)]
struct Step {
    max_depth: usize,
}

pub struct TelnetDebugger {
    link: DebugLink,
    config: DebuggerConfig,
    state: State,
    breakpoints: Vec<Breakpoint>,
    step: Option<Step>,
    paused: bool,
    waiting: bool,
}

impl TelnetDebugger {
    pub fn new(link: DebugLink, config: DebuggerConfig) -> Self {
        Self {
            link,
            config,
            state: State::NotConnected,
            breakpoints: Vec::new(),
            step: None,
            paused: false,
            waiting: false,
        }
    }

    pub fn state(&self) -> State {
        self.state
    }

    pub fn console_tap(&self) -> ConsoleTap {
        self.link.tap()
    }

    /// Handle whatever the client has sent since the last poll.
    pub fn poll(&mut self, vm: &mut VM) {
        self.process_link(vm);
    }

    /// Block until a client authenticates and sends `CONTINUE`. Returns
    /// immediately unless `wait_for_client` is configured.
    pub fn wait_for_client(&mut self, vm: &mut VM) {
        if !self.config.wait_for_client {
            return;
        }
        info!("Waiting for a debugger client");
        self.waiting = true;
        while self.state != State::Connected {
            if !self.process_link(vm) {
                warn!("debugger transport closed while waiting for a client");
                break;
            }
            thread::sleep(self.config.poll_interval());
        }
        self.waiting = false;
    }

    /// Reconcile pending breakpoints against a newly loaded block.
    pub fn on_block_loaded(&mut self, block: &Rc<CodeBlock>) {
        if self.step.is_some() {
            block.set_all_breaks();
        }
        let name = block.name().to_string();
        let mut kept = Vec::with_capacity(self.breakpoints.len());
        for mut bp in std::mem::take(&mut self.breakpoints) {
            if !bp.file.eq_ignore_ascii_case(&name) {
                kept.push(bp);
                continue;
            }
            let actual = block.find_first_break_line(bp.line);
            if actual == 0 {
                self.link.send_line(format!("BRKCLR {} {}", bp.file, bp.line));
                continue;
            }
            if actual != bp.line {
                self.link.send_line(format!("BRKMOV {} {} {}", bp.file, bp.line, actual));
                bp.line = actual;
            }
            block.set_breakpoint(actual);
            kept.push(bp);
        }
        self.breakpoints = kept;
    }

    /// Called by the interpreter at every `BREAK`.
    pub fn execution_stopped(&mut self, vm: &mut VM, block: &Rc<CodeBlock>, line: u32) {
        if self.paused || self.state == State::NotConnected {
            return;
        }
        let mut stop = self.step.is_some_and(|s| vm.call_depth() <= s.max_depth);

        let hit = self
            .breakpoints
            .iter()
            .position(|bp| bp.line == line && bp.file.eq_ignore_ascii_case(block.name()));
        if let Some(index) = hit {
            self.paused = true;
            let condition = self.breakpoints[index].condition.clone();
            let passed = self.check_condition(vm, &condition);
            self.paused = false;
            if passed {
                let bp = &mut self.breakpoints[index];
                bp.cur_count += 1;
                if bp.cur_count >= bp.pass_count {
                    bp.cur_count = 0;
                    if bp.clear_on_hit {
                        let bp = self.breakpoints.remove(index);
                        block.clear_breakpoint(bp.line);
                    }
                    stop = true;
                }
            }
        }

        if stop {
            self.end_step(vm);
            self.break_process(vm);
        }
    }

    fn check_condition(&self, vm: &mut VM, condition: &str) -> bool {
        let condition = condition.trim();
        if condition.is_empty() {
            return true;
        }
        let source = format!("{CONDITION_VAR} = {condition};");
        if let Err(e) = vm.eval_in_frame(&source, 0) {
            warn!("breakpoint condition '{condition}' failed: {e}");
            return false;
        }
        vm.global(CONDITION_VAR).is_some_and(|v| v.to_bool())
    }

    /// Report the stop and service the client until it resumes.
    fn break_process(&mut self, vm: &mut VM) {
        self.paused = true;
        let mut line = String::from("BREAK");
        for frame in vm.stack_trace() {
            line.push_str(&format!(" {} {} {}", frame.file, frame.line, frame.scope));
        }
        self.link.send_line(line);
        debug!("paused at breakpoint");

        while self.paused {
            if !self.process_link(vm) {
                self.disconnect(vm);
                break;
            }
            if self.paused {
                thread::sleep(self.config.poll_interval());
            }
        }
    }

    /// Drain link events. Stops early when a command resumes a paused
    /// script. Returns false once the transport is gone.
    fn process_link(&mut self, vm: &mut VM) -> bool {
        let was_paused = self.paused;
        loop {
            if was_paused && !self.paused {
                return true;
            }
            match self.link.try_recv() {
                Ok(LinkEvent::Connected) => {
                    info!("debugger client connected");
                    self.state = State::PasswordTry;
                }
                Ok(LinkEvent::Line(line)) => self.process_line(vm, &line),
                Ok(LinkEvent::Disconnected) => self.disconnect(vm),
                Err(TryRecvError::Empty) => return true,
                Err(TryRecvError::Disconnected) => return false,
            }
        }
    }

    fn process_line(&mut self, vm: &mut VM, line: &str) {
        match self.state {
            State::NotConnected => {}
            State::PasswordTry => {
                if line == self.config.password {
                    self.link.send_line("PASS Connected.");
                    self.link.set_echo(true);
                    self.state = if self.waiting {
                        State::Initialize
                    } else {
                        State::Connected
                    };
                } else {
                    self.link.send_line("PASS WrongPassword.");
                    self.link.close();
                    self.state = State::NotConnected;
                }
            }
            State::Initialize | State::Connected => self.process_command(vm, line),
        }
    }

    fn process_command(&mut self, vm: &mut VM, line: &str) {
        let (command, rest) = line.split_once(' ').unwrap_or((line, ""));
        let rest = rest.trim();
        match command {
            "CEVAL" => {
                if let Err(e) = vm.eval(rest) {
                    vm.print_line(&e.to_string());
                }
            }
            // Variable watches are accepted and ignored.
            "BRKVARSET" | "BRKVARCLR" => {}
            "BRKSET" => {
                let mut parts = rest.splitn(5, ' ');
                let file = parts.next().filter(|s| !s.is_empty());
                let line_no = parts.next().and_then(|s| s.parse::<u32>().ok());
                let clear = parts.next().map(parse_bool);
                let pass = parts.next().and_then(|s| s.parse::<u32>().ok());
                match (file, line_no, clear, pass) {
                    (Some(file), Some(line_no), Some(clear), Some(pass)) => {
                        let condition = parts.next().unwrap_or("").to_string();
                        self.add_breakpoint(vm, file, line_no, clear, pass, condition);
                    }
                    _ => self.error(line),
                }
            }
            "BRKCLR" => {
                let mut parts = rest.split_whitespace();
                match (parts.next(), parts.next().and_then(|s| s.parse::<u32>().ok())) {
                    (Some(file), Some(line_no)) => self.remove_breakpoint(vm, file, line_no),
                    _ => self.error(line),
                }
            }
            "BRKCLRALL" => self.remove_all_breakpoints(vm),
            "BRKNEXT" => self.begin_step(vm, usize::MAX),
            "CONTINUE" => {
                if self.state == State::Initialize {
                    self.state = State::Connected;
                }
                self.resume();
            }
            "STEPIN" if self.paused => {
                self.begin_step(vm, usize::MAX);
                self.resume();
            }
            "STEPOVER" if self.paused => {
                self.begin_step(vm, vm.call_depth());
                self.resume();
            }
            "STEPOUT" if self.paused => {
                self.begin_step(vm, vm.call_depth().saturating_sub(1));
                self.resume();
            }
            "STEPIN" | "STEPOVER" | "STEPOUT" => self.error(line),
            "EVAL" => {
                let mut parts = rest.splitn(3, ' ');
                match (parts.next(), parts.next(), parts.next()) {
                    (Some(tag), Some(frame), Some(expr)) => {
                        let frame = frame.parse::<usize>().unwrap_or(0);
                        let result = vm
                            .eval_in_frame(&format!("return {expr};"), frame)
                            .unwrap_or_default();
                        let result = if result.is_empty() { "\"\"".to_string() } else { result };
                        self.link.send_line(format!("EVALOUT {tag} {result}"));
                    }
                    _ => self.error(line),
                }
            }
            "FILELIST" => {
                let mut out = String::from("FILELISTOUT");
                for block in vm.blocks().iter() {
                    out.push(' ');
                    out.push_str(block.name());
                }
                self.link.send_line(out);
            }
            "BREAKLIST" if !rest.is_empty() => {
                let Some(list) = vm.blocks().find(rest).map(|b| b.break_list().to_vec()) else {
                    self.link.send_line("DBGERR No such file!");
                    return;
                };
                let mut out = format!("BREAKLISTOUT {rest} {}", list.len() / 2);
                for n in list {
                    out.push_str(&format!(" {n}"));
                }
                self.link.send_line(out);
            }
            _ => self.error(line),
        }
    }

    fn error(&self, line: &str) {
        warn!("unrecognized debugger command: {line}");
        self.link.send_line(format!("DBGERR {line}"));
    }

    fn resume(&mut self) {
        if self.paused {
            self.paused = false;
            self.link.send_line("RUNNING");
        }
    }

    fn add_breakpoint(&mut self, vm: &VM, file: &str, line: u32, clear: bool, pass: u32, condition: String) {
        let mut line = line;
        if let Some(block) = vm.blocks().find(file) {
            let actual = block.find_first_break_line(line);
            if actual == 0 {
                self.link.send_line(format!("BRKCLR {file} {line}"));
                return;
            }
            if actual != line {
                self.link.send_line(format!("BRKMOV {file} {line} {actual}"));
                line = actual;
            }
            block.set_breakpoint(line);
        }
        self.breakpoints
            .retain(|bp| !(bp.line == line && bp.file.eq_ignore_ascii_case(file)));
        debug!(file, line, pass, "breakpoint set");
        self.breakpoints.push(Breakpoint {
            file: file.to_string(),
            line,
            clear_on_hit: clear,
            pass_count: pass,
            cur_count: 0,
            condition,
        });
    }

    fn remove_breakpoint(&mut self, vm: &VM, file: &str, line: u32) {
        self.breakpoints
            .retain(|bp| !(bp.line == line && bp.file.eq_ignore_ascii_case(file)));
        if self.step.is_none() {
            if let Some(block) = vm.blocks().find(file) {
                block.clear_breakpoint(line);
            }
        }
    }

    fn remove_all_breakpoints(&mut self, vm: &VM) {
        self.breakpoints.clear();
        if self.step.is_none() {
            for block in vm.blocks().iter() {
                block.clear_all_breaks();
            }
        }
    }

    /// Arm break-on-next-statement for every loaded block.
    fn begin_step(&mut self, vm: &VM, max_depth: usize) {
        self.step = Some(Step { max_depth });
        for block in vm.blocks().iter() {
            block.set_all_breaks();
        }
    }

    /// Disarm stepping, leaving only real breakpoints in the code.
    fn end_step(&mut self, vm: &VM) {
        if self.step.take().is_none() {
            return;
        }
        for block in vm.blocks().iter() {
            block.clear_all_breaks();
            for bp in self.breakpoints.iter().filter(|bp| bp.file.eq_ignore_ascii_case(block.name())) {
                block.set_breakpoint(bp.line);
            }
        }
    }

    fn disconnect(&mut self, vm: &VM) {
        if self.state != State::NotConnected {
            info!("debugger client disconnected");
        }
        self.step = None;
        self.remove_all_breakpoints(vm);
        self.link.set_echo(false);
        self.paused = false;
        self.state = State::NotConnected;
    }
}

fn parse_bool(s: &str) -> bool {
    s.eq_ignore_ascii_case("true") || s.parse::<i32>().is_ok_and(|n| n != 0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::vm::ops::Opcode;
    use std::io;

    fn attached(password: &str) -> (VM, DebugPeer) {
        let (link, peer) = DebugLink::pair();
        let config = DebuggerConfig {
            password: password.to_string(),
            poll_interval_ms: 1,
            ..DebuggerConfig::default()
        };
        let mut vm = VM::with_output(Box::new(io::sink()));
        vm.attach_debugger(TelnetDebugger::new(link, config));
        (vm, peer)
    }

    fn login(vm: &mut VM, peer: &mut DebugPeer) {
        peer.connect();
        peer.send("pw");
        vm.poll_debugger();
        assert_eq!(peer.lines(), vec!["PASS Connected."]);
    }

    #[test]
    fn test_wrong_password_closes() {
        let (mut vm, mut peer) = attached("pw");
        peer.connect();
        peer.send("guess");
        vm.poll_debugger();
        assert_eq!(
            peer.received(),
            vec![Outgoing::Line("PASS WrongPassword.".into()), Outgoing::Close]
        );
        assert_eq!(vm.debugger().map(TelnetDebugger::state), Some(State::NotConnected));
    }

    #[test]
    fn test_unknown_command_keeps_session() {
        let (mut vm, mut peer) = attached("pw");
        login(&mut vm, &mut peer);
        peer.send("HELLO there");
        peer.send("FILELIST");
        vm.poll_debugger();
        assert_eq!(peer.lines(), vec!["DBGERR HELLO there", "FILELISTOUT"]);
        assert_eq!(vm.debugger().map(TelnetDebugger::state), Some(State::Connected));
    }

    #[test]
    fn test_breaklist_for_unloaded_file() {
        let (mut vm, mut peer) = attached("pw");
        login(&mut vm, &mut peer);
        vm.compile_exec("loaded.cs", "%a = 1;\n").unwrap();
        peer.send("BREAKLIST missing.cs");
        peer.send("BREAKLIST loaded.cs");
        vm.poll_debugger();
        assert_eq!(peer.lines(), vec!["DBGERR No such file!", "BREAKLISTOUT loaded.cs 1 0 1"]);
    }

    #[test]
    fn test_console_output_is_mirrored() {
        let (mut vm, mut peer) = attached("pw");
        vm.compile_exec("early.cs", "echo(\"before\");").unwrap();
        login(&mut vm, &mut peer);
        peer.send("CEVAL echo(\"hi\" @ 1);");
        vm.poll_debugger();
        assert_eq!(peer.lines(), vec!["COUT hi1"]);
    }

    #[test]
    fn test_breakpoint_on_unloaded_file_moves_on_load() {
        let (mut vm, mut peer) = attached("pw");
        login(&mut vm, &mut peer);
        peer.send("BRKSET later.cs 2 false 1 true");
        vm.poll_debugger();
        assert!(peer.lines().is_empty());

        // Line 2 is blank, so the breakpoint lands on line 3 at load time.
        peer.send("CONTINUE");
        vm.compile_exec("later.cs", "%a = 1;\n\n%b = 2;\n").unwrap();
        let lines = peer.lines();
        assert_eq!(lines[0], "BRKMOV later.cs 2 3");
        assert_eq!(lines[1], "BREAK later.cs 3 <none>");
        assert_eq!(lines[2], "RUNNING");
    }

    #[test]
    fn test_breaklist_and_filelist() {
        let (mut vm, mut peer) = attached("pw");
        vm.compile_exec("a.cs", "%x = 1;\n\n%y = 2;\n%z = 3;\n").unwrap();
        login(&mut vm, &mut peer);
        peer.send("FILELIST");
        peer.send("BREAKLIST a.cs");
        peer.send("BREAKLIST missing.cs");
        vm.poll_debugger();
        assert_eq!(
            peer.lines(),
            vec![
                "FILELISTOUT a.cs",
                "BREAKLISTOUT a.cs 2 0 1 1 2",
                "BREAKLISTOUT missing.cs 0",
            ]
        );
    }

    #[test]
    fn test_disconnect_while_paused_resumes() {
        let (mut vm, mut peer) = attached("pw");
        vm.compile_exec("d.cs", "function f() {\n  return 1;\n}\n").unwrap();
        login(&mut vm, &mut peer);
        peer.send("BRKSET d.cs 2 false 1 true");
        vm.poll_debugger();
        assert!(peer.lines().is_empty());

        peer.disconnect();
        assert_eq!(vm.call_function("f", &[]).unwrap(), "1");
        assert_eq!(peer.lines(), vec!["BREAK d.cs 2 f"]);
        assert_eq!(vm.debugger().map(TelnetDebugger::state), Some(State::NotConnected));
        let block = vm.blocks().find("d.cs").unwrap();
        let code = block.code();
        assert!(block.line_breaks().iter().all(|p| code[p.ip as usize] != Opcode::Break.word()));
    }
}
