//! Extension points. Each hook gets an immutable request and answers with a small
//! [`HookResult`]; the session applies the combined answer itself.

use std::{
    net::SocketAddr,
    panic::{AssertUnwindSafe, catch_unwind},
    sync::Arc,
};

use arc_swap::ArcSwap;

use crate::refract::{
    packets::Intent,
    translate::{Direction, Translator},
    version::{ProtocolVersion, TargetVersion},
    wire::Packet,
};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HookResult<T> {
    pub cancelled: bool,
    pub replacement: Option<T>,
    /// Disconnect text when `cancelled`.
    pub message: Option<String>,
}

impl<T> Default for HookResult<T> {
    fn default() -> Self {
        Self {
            cancelled: false,
            replacement: None,
            message: None,
        }
    }
}

impl<T> HookResult<T> {
    pub fn proceed() -> Self {
        Self::default()
    }

    pub fn cancel(message: impl Into<String>) -> Self {
        Self {
            cancelled: true,
            replacement: None,
            message: Some(message.into()),
        }
    }

    pub fn replace(value: T) -> Self {
        Self {
            cancelled: false,
            replacement: Some(value),
            message: None,
        }
    }
}

/// Per-leg packet handler installed in front of the translator.
pub trait PacketFilter: Send + Sync {
    fn name(&self) -> &str;

    /// `Ok(None)` drops the packet.
    fn filter(&self, dir: Direction, packet: Packet) -> anyhow::Result<Option<Packet>>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    Pre,
    Post,
}

#[derive(Debug, Clone)]
pub struct LegInit {
    pub stage: Stage,
    pub client_addr: SocketAddr,
    pub legacy: bool,
}

#[derive(Debug, Clone)]
pub struct SessionCreation {
    pub client_addr: SocketAddr,
    pub client_version: ProtocolVersion,
    pub server_version: ProtocolVersion,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectTarget {
    pub address: String,
    pub version: TargetVersion,
}

#[derive(Debug, Clone)]
pub struct PreConnect {
    pub target: ConnectTarget,
    pub client_version: ProtocolVersion,
    pub client_addr: SocketAddr,
    pub handshake_address: String,
    pub handshake_port: u16,
    pub intent: Intent,
}

#[derive(Debug, Clone)]
pub struct JoinServer {
    pub client_addr: SocketAddr,
    pub server_hash: String,
    pub username: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Resolve {
    pub host: String,
    pub port: u16,
}

pub const DEFAULT_PRE_CONNECT_DENIAL: &str =
    "Could not connect to the backend server! (Server is blacklisted)";

/// Implement the points you care about; the rest proceed.
pub trait Hooks: Send + Sync {
    fn name(&self) -> &str;

    fn client_leg_init(&self, _req: &LegInit) -> HookResult<Arc<dyn PacketFilter>> {
        HookResult::proceed()
    }

    fn backend_leg_init(&self, _req: &LegInit) -> HookResult<Arc<dyn PacketFilter>> {
        HookResult::proceed()
    }

    fn session_creation(&self, _req: &SessionCreation) -> HookResult<Arc<dyn Translator>> {
        HookResult::proceed()
    }

    fn pre_connect(&self, _req: &PreConnect) -> HookResult<ConnectTarget> {
        HookResult::proceed()
    }

    fn join_server(&self, _req: &JoinServer) -> HookResult<()> {
        HookResult::proceed()
    }

    fn resolve_backend(&self, _req: &Resolve) -> HookResult<Resolve> {
        HookResult::proceed()
    }
}

#[derive(Debug, thiserror::Error)]
#[error("hook {hook} panicked")]
pub struct HookPanic {
    pub hook: String,
}

/// Registered hooks, swappable at runtime.
pub struct HookRegistry {
    hooks: ArcSwap<Vec<Arc<dyn Hooks>>>,
}

impl Default for HookRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl HookRegistry {
    pub fn new() -> Self {
        Self {
            hooks: ArcSwap::from_pointee(Vec::new()),
        }
    }

    pub fn register(&self, hook: Arc<dyn Hooks>) {
        self.hooks.rcu(|cur| {
            let mut next = Vec::with_capacity(cur.len() + 1);
            next.extend(cur.iter().cloned());
            next.push(hook.clone());
            next
        });
    }

    pub fn is_empty(&self) -> bool {
        self.hooks.load().is_empty()
    }

    /// Runs every hook in registration order. The first cancellation stops the walk;
    /// later replacements override earlier ones. A panicking hook aborts the dispatch.
    pub fn dispatch<T>(
        &self,
        f: impl Fn(&dyn Hooks) -> HookResult<T>,
    ) -> Result<HookResult<T>, HookPanic> {
        let hooks = self.hooks.load();
        let mut out = HookResult::proceed();
        for h in hooks.iter() {
            let res = catch_unwind(AssertUnwindSafe(|| f(h.as_ref()))).map_err(|_| {
                tracing::error!(hook = %h.name(), "hooks: hook panicked");
                HookPanic {
                    hook: h.name().to_string(),
                }
            })?;
            if res.cancelled {
                return Ok(HookResult {
                    cancelled: true,
                    replacement: None,
                    message: res.message,
                });
            }
            if res.replacement.is_some() {
                out.replacement = res.replacement;
            }
        }
        Ok(out)
    }
}
