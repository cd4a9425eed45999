//! Out-of-band stop requests. The run loop polls [`StopFlag`] once per question; listeners only ever set it.
//! An abort is awaited by `main`, which drops the run and still closes the browser.

use std::{
	io::{BufRead, IsTerminal},
	sync::{
		Arc,
		atomic::{AtomicBool, Ordering},
	},
};

use tokio::sync::Notify;
use v_utils::{elog, log};

#[derive(Debug, Default)]
struct StopState {
	requested: AtomicBool,
	aborted: AtomicBool,
	changed: Notify,
}

/// Shared "stop after this question" flag, plus the harder "abandon the run now" request
#[derive(Clone, Debug, Default)]
pub struct StopFlag(Arc<StopState>);

impl StopFlag {
	pub fn request(&self) {
		self.0.requested.store(true, Ordering::SeqCst);
		self.0.changed.notify_waiters();
	}

	pub fn is_requested(&self) -> bool {
		self.0.requested.load(Ordering::SeqCst)
	}

	/// Abandon the run. Whoever awaits [`StopFlag::aborted`] is expected to close the browser and exit.
	pub fn abort(&self) {
		self.0.requested.store(true, Ordering::SeqCst);
		self.0.aborted.store(true, Ordering::SeqCst);
		self.0.changed.notify_waiters();
	}

	pub fn is_aborted(&self) -> bool {
		self.0.aborted.load(Ordering::SeqCst)
	}

	/// Resolves once a stop was requested (or the run aborted)
	pub async fn requested(&self) {
		loop {
			let changed = self.0.changed.notified();
			if self.is_requested() {
				return;
			}
			changed.await;
		}
	}

	/// Resolves once the run was aborted
	pub async fn aborted(&self) {
		loop {
			let changed = self.0.changed.notified();
			if self.is_aborted() {
				return;
			}
			changed.await;
		}
	}
}

/// What the n-th Ctrl+C of the process does
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Interrupt {
	/// Finish the current question, then wrap up normally
	Graceful,
	/// Drop the run, close the browser, exit 130
	Abort,
	/// Shutdown is stuck, leave without cleanup
	Exit,
}

impl Interrupt {
	pub fn for_press(press: u32) -> Self {
		match press {
			0 | 1 => Interrupt::Graceful,
			2 => Interrupt::Abort,
			_ => Interrupt::Exit,
		}
	}

	/// Act on the flag; only [`Interrupt::Exit`] touches the process directly
	pub fn apply(self, flag: &StopFlag) {
		match self {
			Interrupt::Graceful => {
				log!("Stopping after the current question (Ctrl+C again to abandon the run)...");
				flag.request();
			}
			Interrupt::Abort => {
				elog!("Interrupted again, closing the browser (Ctrl+C once more to exit without cleanup)");
				flag.abort();
			}
			Interrupt::Exit => {
				elog!("Exiting without cleanup");
				std::process::exit(130);
			}
		}
	}
}

/// Something that can set the flag from outside the run loop
pub trait StopListener {
	fn name(&self) -> &'static str;
	/// Start listening in the background; returns immediately
	fn spawn(self: Box<Self>, flag: StopFlag);
}

/// Ctrl+C escalates: graceful stop, then abort through the normal close path, then a hard exit
pub struct CtrlC;

impl StopListener for CtrlC {
	fn name(&self) -> &'static str {
		"ctrl-c"
	}

	fn spawn(self: Box<Self>, flag: StopFlag) {
		tokio::spawn(async move {
			let mut presses = 0u32;
			while tokio::signal::ctrl_c().await.is_ok() {
				presses += 1;
				Interrupt::for_press(presses).apply(&flag);
			}
		});
	}
}

/// `q` + Enter on an interactive stdin
pub struct StdinKey;

impl StopListener for StdinKey {
	fn name(&self) -> &'static str {
		"stdin"
	}

	fn spawn(self: Box<Self>, flag: StopFlag) {
		// stdin reads block, keep them off the runtime
		std::thread::spawn(move || {
			let stdin = std::io::stdin();
			for line in stdin.lock().lines() {
				let Ok(line) = line else { break };
				if is_stop_command(&line) {
					log!("Stop requested, finishing the current question...");
					flag.request();
					break;
				}
			}
		});
	}
}

/// Stand-in when no interactive listener is available
pub struct NoListener;

impl StopListener for NoListener {
	fn name(&self) -> &'static str {
		"none"
	}

	fn spawn(self: Box<Self>, _flag: StopFlag) {}
}

pub fn is_stop_command(line: &str) -> bool {
	matches!(line.trim().to_ascii_lowercase().as_str(), "q" | "quit" | "stop")
}

/// Key listener for this process, decided once
pub fn key_listener(stop_key: bool, stdin_is_terminal: bool) -> Box<dyn StopListener> {
	if stop_key && stdin_is_terminal { Box::new(StdinKey) } else { Box::new(NoListener) }
}

/// Ctrl+C handling for the whole process. Installed as soon as the browser is up, so interrupts during the start prompt also close it.
pub fn install_interrupt() -> StopFlag {
	let flag = StopFlag::default();
	Box::new(CtrlC).spawn(flag.clone());
	flag
}

/// Add the stdin key listener once the start prompt no longer needs stdin
pub fn install_keys(stop_key: bool, flag: &StopFlag) {
	let listener = key_listener(stop_key, std::io::stdin().is_terminal());
	tracing::debug!("Stop key listener: {}", listener.name());
	if listener.name() == "stdin" {
		log!("Type q + Enter (or press Ctrl+C) to stop after the current question");
	}
	listener.spawn(flag.clone());
}
