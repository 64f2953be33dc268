//! Execution-thread actor.
//!
//! The interpreter is single-threaded (`Rc` code blocks, a `Box<dyn Write>`
//! sink), so a [`ConsoleHandle`] confines one [`VM`] to a dedicated OS thread.
//! Other threads post requests over a channel and wait on a oneshot reply,
//! either blocking or from async code. Between requests the actor polls an
//! attached debugger.

use std::io::{self, Write};
use std::path::PathBuf;
use std::sync::mpsc::{self, RecvTimeoutError, Sender};
use std::thread::{self, JoinHandle};

use tokio::sync::oneshot;
use tracing::{debug, error};

use crate::config::RuntimeConfig;
use crate::debugger::{DebugLink, TelnetDebugger};
use crate::error::ConsoleError;
use crate::vm::vm::VM;

type Reply = oneshot::Sender<Result<String, ConsoleError>>;

enum Request {
    Eval { source: String, reply: Reply },
    Exec { path: PathBuf, reply: Reply },
    Call { name: String, args: Vec<String>, reply: Reply },
    Shutdown,
}

/// Builds the VM's output sink on the execution thread.
pub type OutputFactory = Box<dyn FnOnce() -> Box<dyn Write> + Send>;

/// Handle to a VM running on its own thread.
pub struct ConsoleHandle {
    requests: Sender<Request>,
    thread: Option<JoinHandle<()>>,
}

impl ConsoleHandle {
    /// Start a VM writing to stdout.
    pub fn spawn(config: RuntimeConfig) -> io::Result<Self> {
        Self::spawn_with(config, Box::new(|| -> Box<dyn Write> { Box::new(io::stdout()) }), None)
    }

    /// Start a VM with a custom sink and, optionally, a debugger on `link`.
    pub fn spawn_with(config: RuntimeConfig, output: OutputFactory, link: Option<DebugLink>) -> io::Result<Self> {
        let (tx, rx) = mpsc::channel::<Request>();
        let stack_size = config.console_stack_size();
        let thread = thread::Builder::new().name("console".into()).stack_size(stack_size).spawn(move || {
            let poll_interval = config.debugger.poll_interval();
            let debugger_config = config.debugger.clone();
            let mut vm = VM::with_config(config, output());
            if let Some(link) = link {
                vm.attach_debugger(TelnetDebugger::new(link, debugger_config));
                vm.wait_for_debugger();
            }
            loop {
                let request = match rx.recv_timeout(poll_interval) {
                    Ok(request) => request,
                    Err(RecvTimeoutError::Timeout) => {
                        vm.poll_debugger();
                        continue;
                    }
                    Err(RecvTimeoutError::Disconnected) => break,
                };
                let (result, reply) = match request {
                    Request::Eval { source, reply } => (vm.eval(&source), reply),
                    Request::Exec { path, reply } => (vm.exec_file(&path), reply),
                    Request::Call { name, args, reply } => {
                        let args: Vec<&str> = args.iter().map(String::as_str).collect();
                        (vm.call_function(&name, &args), reply)
                    }
                    Request::Shutdown => break,
                };
                vm.flush();
                if reply.send(result).is_err() {
                    debug!("console request abandoned by its caller");
                }
            }
            vm.flush();
            debug!("console thread stopped");
        })?;
        Ok(Self {
            requests: tx,
            thread: Some(thread),
        })
    }

    fn submit(&self, make: impl FnOnce(Reply) -> Request) -> oneshot::Receiver<Result<String, ConsoleError>> {
        let (reply, rx) = oneshot::channel();
        // A send failure drops `reply`, which the receiver sees as closed.
        let _ = self.requests.send(make(reply));
        rx
    }

    /// Evaluate source on the console thread.
    pub async fn eval(&self, source: &str) -> Result<String, ConsoleError> {
        let source = source.to_string();
        let rx = self.submit(|reply| Request::Eval { source, reply });
        rx.await.map_err(|_| ConsoleError::Disconnected)?
    }

    pub async fn exec(&self, path: impl Into<PathBuf>) -> Result<String, ConsoleError> {
        let path = path.into();
        let rx = self.submit(|reply| Request::Exec { path, reply });
        rx.await.map_err(|_| ConsoleError::Disconnected)?
    }

    /// Blocking form of [`ConsoleHandle::eval`]; must not be called from
    /// inside an async runtime.
    pub fn eval_blocking(&self, source: &str) -> Result<String, ConsoleError> {
        let source = source.to_string();
        let rx = self.submit(|reply| Request::Eval { source, reply });
        rx.blocking_recv().map_err(|_| ConsoleError::Disconnected)?
    }

    pub fn exec_blocking(&self, path: impl Into<PathBuf>) -> Result<String, ConsoleError> {
        let path = path.into();
        let rx = self.submit(|reply| Request::Exec { path, reply });
        rx.blocking_recv().map_err(|_| ConsoleError::Disconnected)?
    }

    pub fn call_blocking(&self, name: &str, args: &[&str]) -> Result<String, ConsoleError> {
        let name = name.to_string();
        let args = args.iter().map(|a| a.to_string()).collect();
        let rx = self.submit(|reply| Request::Call { name, args, reply });
        rx.blocking_recv().map_err(|_| ConsoleError::Disconnected)?
    }

    /// Stop the thread after pending requests and wait for it.
    pub fn shutdown(mut self) {
        self.stop();
    }

    fn stop(&mut self) {
        let _ = self.requests.send(Request::Shutdown);
        if let Some(thread) = self.thread.take() {
            if thread.join().is_err() {
                error!("console thread panicked");
            }
        }
    }
}

impl Drop for ConsoleHandle {
    fn drop(&mut self) {
        self.stop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ExecError;
    use std::sync::{Arc, Mutex};

    #[derive(Clone, Default)]
    struct SharedSink(Arc<Mutex<Vec<u8>>>);

    impl Write for SharedSink {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            self.0.lock().unwrap().extend_from_slice(buf);
            Ok(buf.len())
        }
        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    fn spawn_captured() -> (ConsoleHandle, SharedSink) {
        let sink = SharedSink::default();
        let out = sink.clone();
        let handle = ConsoleHandle::spawn_with(RuntimeConfig::default(), Box::new(move || -> Box<dyn Write> { Box::new(out) }), None).unwrap();
        (handle, sink)
    }

    #[test]
    fn test_state_persists_between_requests() {
        let (console, sink) = spawn_captured();
        console.eval_blocking("function twice(%x) { return %x * 2; }").unwrap();
        assert_eq!(console.eval_blocking("return twice(21);").unwrap(), "42");
        assert_eq!(console.call_blocking("twice", &["4"]).unwrap(), "8");
        console.eval_blocking("echo(\"from thread\");").unwrap();
        console.shutdown();
        assert_eq!(String::from_utf8(sink.0.lock().unwrap().clone()).unwrap(), "from thread\n");
    }

    #[test]
    fn test_errors_cross_the_thread() {
        let (console, _) = spawn_captured();
        let err = console.eval_blocking("return (;").unwrap_err();
        assert!(matches!(err, ConsoleError::Compile(_)));
    }

    #[test]
    fn test_deep_recursion_on_console_thread() {
        let (console, _) = spawn_captured();
        console
            .eval_blocking("function down(%n, %limit) { if (%n >= %limit) return %n; return down(%n + 1, %limit); }")
            .unwrap();
        assert_eq!(console.eval_blocking("return down(0, 1000);").unwrap(), "1000");
        let err = console.eval_blocking("return down(0, 5000);").unwrap_err();
        assert!(matches!(err, ConsoleError::Exec(ExecError::StackOverflow { limit: 1024 })));
        // The thread survives the overflow.
        assert_eq!(console.eval_blocking("return down(0, 10);").unwrap(), "10");
    }

    #[test]
    fn test_async_eval_from_other_threads() {
        let (console, _) = spawn_captured();
        let console = Arc::new(console);
        let runtime = tokio::runtime::Builder::new_current_thread().build().unwrap();
        let result = runtime.block_on(async {
            console.eval("$n = 5;").await.unwrap();
            console.eval("return $n + 1;").await
        });
        assert_eq!(result.unwrap(), "6");
    }
}
