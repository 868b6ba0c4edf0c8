//! Remote procedure registration and routing.
//!
//! A function's type tag and reliability are fixed at registration and never
//! vary per call. Where a call executes and where it is sent depends only on
//! (type, local status, owning host):
//!
//! ```text
//! execute          local/standalone   server            client
//!   Server         yes                yes               -
//!   Client         yes                owner is server   yes
//!   Multicast      yes                yes               yes
//!
//! send             client sends when          server sends when
//!   Server         owner == self              never
//!   Client         never                      owner is a remote client
//!   Multicast      never                      always (to every connection)
//! ```

use std::collections::HashMap;

use crate::NetError;
use crate::connection::{HostId, INVALID_HOST_ID};
use crate::context::NetStatus;
use crate::replication::NetId;
use crate::value::{NetValue, NetValueKind};

pub const MAX_RPC_PARAMS: usize = 8;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NetFuncType {
    /// Runs on the authority; the owning client may invoke it remotely.
    Server,
    /// Runs on the owning client; the server invokes it remotely.
    Client,
    /// Runs everywhere; the server fans it out to all connections.
    Multicast,
}

pub type RpcHandler = Box<dyn FnMut(NetId, &[NetValue])>;

pub struct NetFunc {
    pub name: String,
    pub kind: NetFuncType,
    pub reliable: bool,
    pub params: Vec<NetValueKind>,
    handler: RpcHandler,
}

/// Registered remote-callable functions, addressed by a stable u8 index.
/// Both sides must register the same functions in the same order.
#[derive(Default)]
pub struct RpcRegistry {
    funcs: Vec<NetFunc>,
    by_name: HashMap<String, u8>,
}

impl RpcRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(
        &mut self,
        name: impl Into<String>,
        kind: NetFuncType,
        reliable: bool,
        params: Vec<NetValueKind>,
        handler: RpcHandler,
    ) -> Result<u8, NetError> {
        let name = name.into();
        if params.len() > MAX_RPC_PARAMS {
            return Err(NetError::TooManyParams(params.len()));
        }
        if self.by_name.contains_key(&name) {
            return Err(NetError::DuplicateFunc(name));
        }
        if self.funcs.len() > u8::MAX as usize {
            return Err(NetError::InvalidState("rpc registry full"));
        }

        let index = self.funcs.len() as u8;
        self.by_name.insert(name.clone(), index);
        self.funcs.push(NetFunc {
            name,
            kind,
            reliable,
            params,
            handler,
        });
        Ok(index)
    }

    pub fn get(&self, index: u8) -> Option<&NetFunc> {
        self.funcs.get(index as usize)
    }

    pub fn index_of(&self, name: &str) -> Option<u8> {
        self.by_name.get(name).copied()
    }

    pub fn len(&self) -> usize {
        self.funcs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.funcs.is_empty()
    }

    /// Whether an argument list matches the declared signature. Used as-is
    /// for traffic off the wire, where a mismatch is a protocol error, not
    /// a bug.
    pub fn args_match(&self, index: u8, args: &[NetValue]) -> bool {
        match self.funcs.get(index as usize) {
            Some(func) => {
                args.len() == func.params.len()
                    && args
                        .iter()
                        .zip(&func.params)
                        .all(|(arg, kind)| arg.kind() == *kind)
            }
            None => false,
        }
    }

    /// Validate a locally supplied argument list. A mismatch here is caller
    /// misuse: asserts in debug builds, error in release.
    pub fn check_args(&self, index: u8, args: &[NetValue]) -> Result<(), NetError> {
        let func = self
            .funcs
            .get(index as usize)
            .ok_or(NetError::UnknownFunc(index))?;

        if !self.args_match(index, args) {
            debug_assert!(
                false,
                "argument mismatch calling rpc '{}': expected {:?}",
                func.name, func.params
            );
            return Err(NetError::SignatureMismatch(func.name.clone()));
        }
        Ok(())
    }

    /// Run the handler. Arguments must already be validated.
    pub fn execute(&mut self, index: u8, net_id: NetId, args: &[NetValue]) {
        if let Some(func) = self.funcs.get_mut(index as usize) {
            (func.handler)(net_id, args);
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RpcTarget {
    None,
    Server,
    Host(HostId),
    AllClients,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RpcRoute {
    pub execute_local: bool,
    pub target: RpcTarget,
}

/// Decide, for a locally invoked call, where it runs and where it is sent.
/// Returns `None` when the local host has no right to make the call (a
/// client invoking a Server function on an object it does not own).
pub fn route_call(
    kind: NetFuncType,
    status: NetStatus,
    owner: HostId,
    local_host: HostId,
) -> Option<RpcRoute> {
    let route = match status {
        NetStatus::Local => RpcRoute {
            execute_local: true,
            target: RpcTarget::None,
        },
        NetStatus::Server => match kind {
            NetFuncType::Server => RpcRoute {
                execute_local: true,
                target: RpcTarget::None,
            },
            NetFuncType::Client => {
                if owner == INVALID_HOST_ID {
                    RpcRoute {
                        execute_local: true,
                        target: RpcTarget::None,
                    }
                } else {
                    RpcRoute {
                        execute_local: false,
                        target: RpcTarget::Host(owner),
                    }
                }
            }
            NetFuncType::Multicast => RpcRoute {
                execute_local: true,
                target: RpcTarget::AllClients,
            },
        },
        NetStatus::Client => match kind {
            NetFuncType::Server => {
                if owner == local_host {
                    RpcRoute {
                        execute_local: false,
                        target: RpcTarget::Server,
                    }
                } else {
                    return None;
                }
            }
            NetFuncType::Client | NetFuncType::Multicast => RpcRoute {
                execute_local: true,
                target: RpcTarget::None,
            },
        },
    };
    Some(route)
}

/// Whether a call arriving off the wire is legitimate for this endpoint.
pub fn accepts_remote(kind: NetFuncType, status: NetStatus) -> bool {
    matches!(
        (kind, status),
        (NetFuncType::Server, NetStatus::Server)
            | (NetFuncType::Client, NetStatus::Client)
            | (NetFuncType::Multicast, NetStatus::Client)
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::RefCell;
    use std::rc::Rc;

    #[test]
    fn test_register_and_execute() {
        let mut registry = RpcRegistry::new();
        let calls = Rc::new(RefCell::new(Vec::new()));

        let sink = Rc::clone(&calls);
        let index = registry
            .register(
                "heal",
                NetFuncType::Client,
                true,
                vec![NetValueKind::I32],
                Box::new(move |net_id, args| {
                    if let NetValue::I32(amount) = args[0] {
                        sink.borrow_mut().push((net_id, amount));
                    }
                }),
            )
            .unwrap();

        let args = [NetValue::I32(25)];
        registry.check_args(index, &args).unwrap();
        registry.execute(index, 7, &args);

        assert_eq!(*calls.borrow(), vec![(7, 25)]);
        assert_eq!(registry.index_of("heal"), Some(index));
    }

    #[test]
    fn test_registration_limits() {
        let mut registry = RpcRegistry::new();
        let too_many = vec![NetValueKind::I32; MAX_RPC_PARAMS + 1];
        assert!(matches!(
            registry.register("a", NetFuncType::Server, true, too_many, Box::new(|_, _| {})),
            Err(NetError::TooManyParams(_))
        ));

        registry
            .register("b", NetFuncType::Server, true, vec![], Box::new(|_, _| {}))
            .unwrap();
        assert!(matches!(
            registry.register("b", NetFuncType::Server, true, vec![], Box::new(|_, _| {})),
            Err(NetError::DuplicateFunc(_))
        ));
    }

    #[cfg(not(debug_assertions))]
    #[test]
    fn test_bad_args_are_an_error() {
        let mut registry = RpcRegistry::new();
        let index = registry
            .register(
                "shout",
                NetFuncType::Multicast,
                false,
                vec![NetValueKind::String],
                Box::new(|_, _| {}),
            )
            .unwrap();

        assert!(registry.check_args(index, &[]).is_err());
        assert!(registry.check_args(index, &[NetValue::I32(1)]).is_err());
        assert!(registry.check_args(99, &[]).is_err());
    }

    #[test]
    fn test_routing_on_server() {
        let status = NetStatus::Server;

        let r = route_call(NetFuncType::Server, status, 0, 0).unwrap();
        assert!(r.execute_local);
        assert_eq!(r.target, RpcTarget::None);

        // Client function on a server-owned object runs locally.
        let r = route_call(NetFuncType::Client, status, INVALID_HOST_ID, 0).unwrap();
        assert!(r.execute_local);
        assert_eq!(r.target, RpcTarget::None);

        // Client function on a remotely owned object goes to that owner only.
        let r = route_call(NetFuncType::Client, status, 3, 0).unwrap();
        assert!(!r.execute_local);
        assert_eq!(r.target, RpcTarget::Host(3));

        let r = route_call(NetFuncType::Multicast, status, 0, 0).unwrap();
        assert!(r.execute_local);
        assert_eq!(r.target, RpcTarget::AllClients);
    }

    #[test]
    fn test_routing_on_client() {
        let status = NetStatus::Client;

        // Server function on an owned object travels to the server.
        let r = route_call(NetFuncType::Server, status, 2, 2).unwrap();
        assert!(!r.execute_local);
        assert_eq!(r.target, RpcTarget::Server);

        // Not our object: no right to call.
        assert!(route_call(NetFuncType::Server, status, 3, 2).is_none());

        let r = route_call(NetFuncType::Client, status, 2, 2).unwrap();
        assert!(r.execute_local);
        assert_eq!(r.target, RpcTarget::None);

        let r = route_call(NetFuncType::Multicast, status, 0, 2).unwrap();
        assert!(r.execute_local);
        assert_eq!(r.target, RpcTarget::None);
    }

    #[test]
    fn test_routing_standalone() {
        for kind in [
            NetFuncType::Server,
            NetFuncType::Client,
            NetFuncType::Multicast,
        ] {
            let r = route_call(kind, NetStatus::Local, 0, 0).unwrap();
            assert!(r.execute_local);
            assert_eq!(r.target, RpcTarget::None);
        }
    }

    #[test]
    fn test_remote_acceptance() {
        assert!(accepts_remote(NetFuncType::Server, NetStatus::Server));
        assert!(accepts_remote(NetFuncType::Client, NetStatus::Client));
        assert!(accepts_remote(NetFuncType::Multicast, NetStatus::Client));

        assert!(!accepts_remote(NetFuncType::Client, NetStatus::Server));
        assert!(!accepts_remote(NetFuncType::Multicast, NetStatus::Server));
        assert!(!accepts_remote(NetFuncType::Server, NetStatus::Client));
        assert!(!accepts_remote(NetFuncType::Server, NetStatus::Local));
    }
}
