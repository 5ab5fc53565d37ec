use snafu::{ResultExt, Snafu};
use std::{fmt, result};

use crate::probes::{NewAnonPage, TaskExit, WriteFault};

/// Replacement code for an intercepted kernel function.
///
/// The replacement runs first, the original function always runs after it.
pub enum Hook {
    WriteFault(Box<dyn Fn(&WriteFault) + Send + Sync>),
    NewAnonPage(Box<dyn Fn(&NewAnonPage) + Send + Sync>),
    TaskExit(Box<dyn Fn(&TaskExit) + Send + Sync>),
}

impl Hook {
    pub fn kind(&self) -> &'static str {
        match self {
            Hook::WriteFault(_) => "write fault",
            Hook::NewAnonPage(_) => "new anonymous page",
            Hook::TaskExit(_) => "task exit",
        }
    }
}

impl fmt::Debug for Hook {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Hook({})", self.kind())
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct HookHandle(pub u64);

/// Installs and removes redirections on named kernel functions.
pub trait InterceptionProvider: Send {
    fn install(&mut self, symbol: &str, hook: Hook) -> Result<HookHandle>;
    fn remove(&mut self, handle: HookHandle) -> Result<()>;
}

/// All the redirections installed by one activation of the subsystem.
pub struct ProbeSet {
    provider: Box<dyn InterceptionProvider>,
    installed: Vec<(String, HookHandle)>,
}

impl ProbeSet {
    pub fn new(provider: Box<dyn InterceptionProvider>) -> Self {
        Self {
            provider,
            installed: Vec::new(),
        }
    }

    pub fn try_hook(&mut self, symbol: &str, hook: Hook) -> Result<()> {
        log::debug!("Hooking {} ({})", symbol, hook.kind());
        let handle = self
            .provider
            .install(symbol, hook)
            .map_err(Box::new)
            .context(HookFailed {
                symbol: symbol.to_string(),
            })?;

        self.installed.push((symbol.to_string(), handle));
        Ok(())
    }

    /// Removes every installed redirection, newest first.
    pub fn unhook_all(&mut self) {
        while let Some((symbol, handle)) = self.installed.pop() {
            log::debug!("Unhooking {}", symbol);
            if let Err(error) = self.provider.remove(handle) {
                log::error!("Could not unhook {}: {}", symbol, error);
            }
        }
    }

    pub fn symbols(&self) -> impl Iterator<Item = &str> {
        self.installed.iter().map(|(symbol, _)| symbol.as_str())
    }

    pub fn len(&self) -> usize {
        self.installed.len()
    }

    pub fn is_empty(&self) -> bool {
        self.installed.is_empty()
    }
}

impl Drop for ProbeSet {
    fn drop(&mut self) {
        self.unhook_all();
    }
}

pub type Result<T> = result::Result<T, Error>;

#[derive(Debug, Snafu)]
pub enum Error {
    #[snafu(display("Could not redirect {}: {}", symbol, reason))]
    InstallFailed { symbol: String, reason: String },
    #[snafu(display("Unknown hook: {:?}", handle))]
    UnknownHandle { handle: HookHandle },
    #[snafu(display("Unable to hook {}: {}", symbol, source))]
    HookFailed { symbol: String, source: Box<Error> },
}
