//! The RPC protocol engine.
//!
//! One engine sits on each end of a [`Link`]. It serves local handlers to
//! the other side, turns proxy calls into request messages, matches
//! responses to outstanding calls by id, and tears everything down when
//! either side goes away.

use std::collections::HashMap;
use std::fmt;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock};

use futures_util::FutureExt;
use rpcplex_frame::{Drained, Frame, FrameError, Link, LinkReceiver, LinkSender, CONTROL, RPC};
use serde_json::Value;
use tokio::sync::{oneshot, watch};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::control::ControlMessage;
use crate::disposable::Disposable;
use crate::error::{Result, RpcError};
use crate::event::{Emitter, Subscription};
use crate::handler::{CallContext, Handler, MethodFn};
use crate::identifier::ProxyIdentifier;
use crate::message::{FailureCode, Message, Outcome};
use crate::proxy::{Completion, FromProxy, PendingCall, Proxy, Target};
use crate::value::{structural_clone, Arg, Args, PassthroughConverter, ValueConverter};

/// Engine configuration.
#[derive(Clone)]
pub struct ProtocolConfig {
    /// Name used in log output to tell engines apart.
    pub label: String,
    /// Channel carrying RPC messages. Default: [`RPC`].
    pub rpc_channel: u16,
    /// Channel carrying goodbye messages. Default: [`CONTROL`].
    pub control_channel: u16,
    /// Hook for values JSON cannot express. Default: [`PassthroughConverter`].
    pub converter: Arc<dyn ValueConverter>,
}

impl Default for ProtocolConfig {
    fn default() -> Self {
        Self {
            label: "rpc".to_string(),
            rpc_channel: RPC,
            control_channel: CONTROL,
            converter: Arc::new(PassthroughConverter),
        }
    }
}

impl fmt::Debug for ProtocolConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProtocolConfig")
            .field("label", &self.label)
            .field("rpc_channel", &self.rpc_channel)
            .field("control_channel", &self.control_channel)
            .finish_non_exhaustive()
    }
}

/// Lifecycle of an engine. Only ever moves forward.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProtocolState {
    Open,
    Closing,
    Closed,
}

/// Why an engine closed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseReason {
    /// [`RpcProtocol::close`] was called or the engine was dropped.
    Local,
    /// The link's inbound side ended.
    LinkClosed,
    /// The other side said goodbye.
    RemoteGoodbye,
}

struct PendingEntry {
    proxy: Arc<str>,
    method: Arc<str>,
    completion: Completion,
    /// Set for calls served by a local handler.
    local: Option<CancellationToken>,
}

pub(crate) struct Shared {
    label: String,
    rpc_channel: u16,
    control_channel: u16,
    converter: Arc<dyn ValueConverter>,
    state: watch::Sender<ProtocolState>,
    outbound: Mutex<Option<LinkSender>>,
    next_id: AtomicU64,
    pending: Mutex<HashMap<u64, PendingEntry>>,
    inbound: Mutex<HashMap<u64, CancellationToken>>,
    handlers: RwLock<HashMap<String, Handler>>,
    proxies: Mutex<HashMap<String, Proxy>>,
    shutdown: CancellationToken,
    on_close: Emitter<CloseReason>,
    close_reason: Mutex<Option<CloseReason>>,
    drained: Drained,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// One end of a bidirectional RPC channel.
///
/// Dropping the engine closes it.
pub struct RpcProtocol {
    shared: Arc<Shared>,
}

impl RpcProtocol {
    /// Start an engine on `link` with default configuration.
    ///
    /// Must be called from within a tokio runtime.
    pub fn new(link: Link) -> Self {
        Self::with_config(link, ProtocolConfig::default())
    }

    pub fn with_config(link: Link, config: ProtocolConfig) -> Self {
        let drained = link.drained();
        let (sender, receiver) = link.split();
        let (state, _) = watch::channel(ProtocolState::Open);
        let shared = Arc::new(Shared {
            label: config.label,
            rpc_channel: config.rpc_channel,
            control_channel: config.control_channel,
            converter: config.converter,
            state,
            outbound: Mutex::new(Some(sender)),
            next_id: AtomicU64::new(1),
            pending: Mutex::new(HashMap::new()),
            inbound: Mutex::new(HashMap::new()),
            handlers: RwLock::new(HashMap::new()),
            proxies: Mutex::new(HashMap::new()),
            shutdown: CancellationToken::new(),
            on_close: Emitter::new(),
            close_reason: Mutex::new(None),
            drained,
        });

        debug!(label = %shared.label, "rpc protocol open");
        tokio::spawn(dispatch_loop(Arc::clone(&shared), receiver));

        Self { shared }
    }

    pub fn label(&self) -> &str {
        &self.shared.label
    }

    /// Serve `handler` under `identifier` and return a proxy bound to it.
    ///
    /// A previous registration under the same name is replaced.
    pub fn set<T: FromProxy>(
        &self,
        identifier: &ProxyIdentifier<T>,
        handler: impl Into<Handler>,
    ) -> T {
        let handler = handler.into();
        self.shared.register(identifier.name(), handler.clone());
        T::from_proxy(Proxy::local(
            identifier.shared_name(),
            handler,
            Arc::downgrade(&self.shared),
        ))
    }

    /// Serve `handler` under a plain name.
    pub fn set_handler(&self, name: &str, handler: impl Into<Handler>) {
        self.shared.register(name, handler.into());
    }

    /// Stop serving `identifier`. Returns false if nothing was registered.
    pub fn unset<T: ?Sized>(&self, identifier: &ProxyIdentifier<T>) -> bool {
        self.remove_handler(identifier.name())
    }

    pub fn remove_handler(&self, name: &str) -> bool {
        let removed = self
            .shared
            .handlers
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(name)
            .is_some();
        if removed {
            debug!(label = %self.shared.label, proxy = name, "handler removed");
        }
        removed
    }

    /// Names with a registered handler, sorted.
    pub fn handler_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self
            .shared
            .handlers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .keys()
            .cloned()
            .collect();
        names.sort_unstable();
        names
    }

    /// Typed proxy for the handler the other side serves under `identifier`.
    pub fn get_proxy<T: FromProxy>(&self, identifier: &ProxyIdentifier<T>) -> T {
        let proxy = lock(&self.shared.proxies)
            .entry(identifier.name().to_string())
            .or_insert_with(|| {
                Proxy::remote(identifier.shared_name(), Arc::downgrade(&self.shared))
            })
            .clone();
        T::from_proxy(proxy)
    }

    /// Untyped proxy for a remote handler name.
    pub fn proxy_for(&self, name: &str) -> Proxy {
        let mut proxies = lock(&self.shared.proxies);
        proxies
            .entry(name.to_string())
            .or_insert_with(|| Proxy::remote(Arc::from(name), Arc::downgrade(&self.shared)))
            .clone()
    }

    pub fn state(&self) -> ProtocolState {
        *self.shared.state.borrow()
    }

    pub fn is_open(&self) -> bool {
        self.shared.is_open()
    }

    /// Number of outbound calls still waiting for a response.
    pub fn pending_calls(&self) -> usize {
        lock(&self.shared.pending).len()
    }

    /// Why the engine closed, once it has.
    pub fn close_reason(&self) -> Option<CloseReason> {
        *lock(&self.shared.close_reason)
    }

    /// Observe the close event.
    ///
    /// If the engine has already closed the listener runs immediately.
    pub fn on_close(
        &self,
        listener: impl Fn(&CloseReason) + Send + Sync + 'static,
    ) -> Subscription {
        let guard = lock(&self.shared.close_reason);
        let Some(reason) = *guard else {
            // Subscribed under the lock so a concurrent close cannot fire
            // before this listener is in place.
            return self.shared.on_close.subscribe(listener);
        };
        drop(guard);
        listener(&reason);
        Subscription::empty()
    }

    /// Close the engine. Idempotent.
    ///
    /// Every pending call fails with [`RpcError::ChannelClosed`], in-flight
    /// handlers see their tokens cancelled and the other side is sent a
    /// goodbye.
    pub fn close(&self) {
        self.shared.begin_close(CloseReason::Local);
    }

    /// Wait until the engine has closed, for whatever reason, and every
    /// frame it queued (the goodbye included) has been written out.
    pub async fn closed(&self) {
        let mut state = self.shared.state.subscribe();
        let _ = state
            .wait_for(|state| *state == ProtocolState::Closed)
            .await;
        self.shared.drained.clone().wait().await;
    }
}

impl Drop for RpcProtocol {
    fn drop(&mut self) {
        self.shared.begin_close(CloseReason::Local);
    }
}

impl Disposable for RpcProtocol {
    fn dispose(&mut self) {
        self.close();
    }
}

impl fmt::Debug for RpcProtocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RpcProtocol")
            .field("label", &self.shared.label)
            .field("state", &self.state())
            .field("pending_calls", &self.pending_calls())
            .finish()
    }
}

impl Shared {
    fn is_open(&self) -> bool {
        *self.state.borrow() == ProtocolState::Open
    }

    fn register(&self, name: &str, handler: Handler) {
        if !self.is_open() {
            debug!(label = %self.label, proxy = name, "registering handler on closed protocol");
        }
        let replaced = self
            .handlers
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(name.to_string(), handler)
            .is_some();
        debug!(label = %self.label, proxy = name, replaced, "handler registered");
    }

    fn handler(&self, name: &str) -> Option<Handler> {
        self.handlers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(name)
            .cloned()
    }

    fn clone_args(&self, args: &[Arg]) -> Result<Vec<Value>> {
        args.iter()
            .map(|arg| structural_clone(arg, self.converter.as_ref()))
            .collect()
    }

    fn revive_args(&self, args: Vec<Value>) -> Args {
        Args::new(
            args.into_iter()
                .map(|value| self.converter.revive(value))
                .collect(),
        )
    }

    fn transmit(&self, message: &Message) -> Result<()> {
        let payload = message.encode()?;
        let outbound = lock(&self.outbound);
        let sender = outbound.as_ref().ok_or(RpcError::ChannelClosed)?;
        sender
            .send(Frame::new(self.rpc_channel, payload))
            .map_err(|err| match err {
                FrameError::LinkClosed => RpcError::ChannelClosed,
                other => RpcError::Frame(other),
            })
    }

    pub(crate) fn start_call(
        self: &Arc<Self>,
        proxy: &Arc<str>,
        target: &Target,
        method: &str,
        args: &[Arg],
    ) -> Result<PendingCall> {
        if !self.is_open() {
            return Err(RpcError::ChannelClosed);
        }
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let args = self.clone_args(args)?;
        let method: Arc<str> = Arc::from(method);
        let (completion, rx) = oneshot::channel();

        let local = match target {
            Target::Remote => None,
            Target::Local(_) => Some(self.shutdown.child_token()),
        };

        {
            // Checked again under the table lock: close drains the table
            // after leaving Open, so nothing inserted here can be missed.
            let mut pending = lock(&self.pending);
            if !self.is_open() {
                return Err(RpcError::ChannelClosed);
            }
            pending.insert(
                id,
                PendingEntry {
                    proxy: Arc::clone(proxy),
                    method: Arc::clone(&method),
                    completion,
                    local: local.clone(),
                },
            );
        }

        match (target, local) {
            (Target::Local(handler), Some(token)) => {
                let table = handler.resolve();
                let args = self.revive_args(args);
                let ctx =
                    CallContext::new(Some(id), Arc::clone(proxy), Arc::clone(&method), token);
                let shared = Arc::clone(self);
                let invocation = table.method(&method);
                tokio::spawn(async move {
                    let outcome = shared.run(invocation, args, ctx).await;
                    shared.settle(id, outcome);
                });
            }
            _ => {
                let message = Message::Request {
                    id,
                    proxy: proxy.to_string(),
                    method: method.to_string(),
                    args,
                };
                if let Err(err) = self.transmit(&message) {
                    lock(&self.pending).remove(&id);
                    return Err(err);
                }
            }
        }

        debug!(label = %self.label, id, proxy = %proxy, method = %method, "call started");
        Ok(PendingCall::new(id, rx, Arc::downgrade(self)))
    }

    pub(crate) fn notify(
        self: &Arc<Self>,
        proxy: &Arc<str>,
        target: &Target,
        method: &str,
        args: &[Arg],
    ) -> Result<()> {
        if !self.is_open() {
            return Err(RpcError::ChannelClosed);
        }
        let args = self.clone_args(args)?;
        match target {
            Target::Remote => self.transmit(&Message::Notification {
                proxy: proxy.to_string(),
                method: method.to_string(),
                args,
            }),
            Target::Local(handler) => {
                self.spawn_notification(handler, Arc::clone(proxy), Arc::from(method), args);
                Ok(())
            }
        }
    }

    /// Resolve a pending call from its outcome. Unknown ids are dropped.
    fn settle(&self, id: u64, outcome: Outcome) {
        let Some(entry) = lock(&self.pending).remove(&id) else {
            debug!(label = %self.label, id, "discarding response for unknown call");
            return;
        };
        let result = match outcome {
            Outcome::Success { value } => Ok(self.converter.revive(value)),
            Outcome::Failure { error } => Err(error.into_error(&entry.proxy, &entry.method)),
        };
        let _ = entry.completion.send(result);
    }

    pub(crate) fn cancel_call(&self, id: u64) -> bool {
        let Some(entry) = lock(&self.pending).remove(&id) else {
            return false;
        };
        match &entry.local {
            Some(token) => token.cancel(),
            None => {
                let message = Message::Cancel {
                    id,
                    proxy: entry.proxy.to_string(),
                };
                if let Err(err) = self.transmit(&message) {
                    debug!(label = %self.label, id, error = %err, "cancel not sent");
                }
            }
        }
        debug!(
            label = %self.label,
            id,
            proxy = %entry.proxy,
            method = %entry.method,
            "call cancelled"
        );
        let _ = entry.completion.send(Err(RpcError::Cancelled));
        true
    }

    /// Run one method body to an outcome, containing panics.
    async fn run(
        &self,
        invocation: Option<Arc<MethodFn>>,
        args: Args,
        ctx: CallContext,
    ) -> Outcome {
        let proxy = ctx.proxy().to_string();
        let method = ctx.method().to_string();
        let Some(invocation) = invocation else {
            return Outcome::failure(
                FailureCode::MethodNotFound,
                format!("method '{method}' not found on '{proxy}'"),
            );
        };

        match AssertUnwindSafe(invocation(args, ctx)).catch_unwind().await {
            Ok(Ok(result)) => match structural_clone(&result, self.converter.as_ref()) {
                Ok(value) => Outcome::success(value),
                Err(err) => Outcome::failure(FailureCode::HandlerError, err.to_string()),
            },
            Ok(Err(err)) if err.is_cancelled() => {
                Outcome::failure(FailureCode::Cancelled, err.message())
            }
            Ok(Err(err)) => Outcome::failure(FailureCode::HandlerError, err.message()),
            Err(panic) => {
                let message = panic_message(panic.as_ref());
                warn!(
                    label = %self.label,
                    proxy = %proxy,
                    method = %method,
                    panic = %message,
                    "handler panicked"
                );
                Outcome::failure(FailureCode::HandlerError, message)
            }
        }
    }

    fn spawn_notification(
        self: &Arc<Self>,
        handler: &Handler,
        proxy: Arc<str>,
        method: Arc<str>,
        args: Vec<Value>,
    ) {
        let table = handler.resolve();
        let Some(invocation) = table.method(&method) else {
            warn!(
                label = %self.label,
                proxy = %proxy,
                method = %method,
                "dropping notification for unknown method"
            );
            return;
        };
        let args = self.revive_args(args);
        let ctx = CallContext::new(None, proxy, method, self.shutdown.child_token());
        let shared = Arc::clone(self);
        tokio::spawn(async move {
            let proxy = ctx.proxy().to_string();
            let method = ctx.method().to_string();
            if let Outcome::Failure { error } = shared.run(Some(invocation), args, ctx).await {
                warn!(
                    label = %shared.label,
                    proxy = %proxy,
                    method = %method,
                    error = %error.message,
                    "notification handler failed"
                );
            }
        });
    }

    fn respond(&self, id: u64, proxy: &str, outcome: Outcome) {
        let message = Message::Response {
            id,
            proxy: proxy.to_string(),
            outcome,
        };
        let err = match self.transmit(&message) {
            Ok(()) => return,
            Err(err @ RpcError::Frame(FrameError::PayloadTooLarge { .. })) => err,
            Err(err) => {
                debug!(label = %self.label, id, proxy, error = %err, "response not sent");
                return;
            }
        };
        // The caller still gets exactly one response.
        warn!(label = %self.label, id, proxy, error = %err, "response too large");
        let fallback = Message::Response {
            id,
            proxy: proxy.to_string(),
            outcome: Outcome::failure(
                FailureCode::HandlerError,
                format!("response not sent: {err}"),
            ),
        };
        if let Err(err) = self.transmit(&fallback) {
            debug!(label = %self.label, id, proxy, error = %err, "response not sent");
        }
    }

    fn handle_request(
        self: &Arc<Self>,
        id: u64,
        proxy: String,
        method: String,
        args: Vec<Value>,
    ) {
        let Some(handler) = self.handler(&proxy) else {
            debug!(label = %self.label, id, proxy = %proxy, "request for unknown proxy");
            self.respond(
                id,
                &proxy,
                Outcome::failure(
                    FailureCode::HandlerNotFound,
                    format!("no handler registered for '{proxy}'"),
                ),
            );
            return;
        };

        let table = handler.resolve();
        let Some(invocation) = table.method(&method) else {
            debug!(
                label = %self.label,
                id,
                proxy = %proxy,
                method = %method,
                "request for unknown method"
            );
            self.respond(
                id,
                &proxy,
                Outcome::failure(
                    FailureCode::MethodNotFound,
                    format!("method '{method}' not found on '{proxy}'"),
                ),
            );
            return;
        };

        let token = self.shutdown.child_token();
        lock(&self.inbound).insert(id, token.clone());

        let args = self.revive_args(args);
        let proxy: Arc<str> = Arc::from(proxy);
        let ctx = CallContext::new(Some(id), Arc::clone(&proxy), Arc::from(method), token);
        let shared = Arc::clone(self);
        tokio::spawn(async move {
            let outcome = shared.run(Some(invocation), args, ctx).await;
            lock(&shared.inbound).remove(&id);
            shared.respond(id, &proxy, outcome);
        });
    }

    fn handle_rpc(self: &Arc<Self>, payload: &[u8]) {
        let message = match Message::decode(payload) {
            Ok(message) => message,
            Err(err) => {
                warn!(label = %self.label, error = %err, "dropping malformed rpc message");
                return;
            }
        };

        match message {
            Message::Request {
                id,
                proxy,
                method,
                args,
            } => self.handle_request(id, proxy, method, args),
            Message::Response { id, outcome, .. } => self.settle(id, outcome),
            Message::Notification {
                proxy,
                method,
                args,
            } => match self.handler(&proxy) {
                Some(handler) => {
                    self.spawn_notification(&handler, Arc::from(proxy), Arc::from(method), args)
                }
                None => warn!(
                    label = %self.label,
                    proxy = %proxy,
                    method = %method,
                    "dropping notification for unknown proxy"
                ),
            },
            Message::Cancel { id, proxy } => match lock(&self.inbound).get(&id) {
                Some(token) => {
                    debug!(label = %self.label, id, proxy = %proxy, "remote cancelled call");
                    token.cancel();
                }
                None => debug!(label = %self.label, id, proxy = %proxy, "cancel for unknown call"),
            },
        }
    }

    /// Returns true when the peer said goodbye.
    fn handle_control(&self, payload: &[u8]) -> bool {
        match serde_json::from_slice::<ControlMessage>(payload) {
            Ok(message) if message.is_goodbye() => {
                debug!(label = %self.label, reason = ?message.reason(), "received goodbye");
                true
            }
            Ok(message) => {
                debug!(label = %self.label, msg_type = %message.msg_type, "ignoring control message");
                false
            }
            Err(err) => {
                warn!(label = %self.label, error = %err, "dropping malformed control message");
                false
            }
        }
    }

    fn begin_close(&self, reason: CloseReason) {
        let opened = self.state.send_if_modified(|state| {
            if *state == ProtocolState::Open {
                *state = ProtocolState::Closing;
                true
            } else {
                false
            }
        });
        if !opened {
            return;
        }

        let outbound = lock(&self.outbound).take();
        if let (Some(sender), CloseReason::Local) = (outbound, reason) {
            match serde_json::to_vec(&ControlMessage::goodbye(None)) {
                Ok(payload) => {
                    if sender
                        .send(Frame::new(self.control_channel, payload))
                        .is_err()
                    {
                        debug!(label = %self.label, "link already closed; goodbye not sent");
                    }
                }
                Err(err) => debug!(label = %self.label, error = %err, "goodbye not encoded"),
            }
        }

        let pending: Vec<PendingEntry> = lock(&self.pending)
            .drain()
            .map(|(_, entry)| entry)
            .collect();
        let rejected = pending.len();
        for entry in pending {
            if let Some(token) = entry.local {
                token.cancel();
            }
            let _ = entry.completion.send(Err(RpcError::ChannelClosed));
        }
        for (_, token) in lock(&self.inbound).drain() {
            token.cancel();
        }
        self.handlers
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .clear();
        lock(&self.proxies).clear();
        self.shutdown.cancel();

        self.state.send_replace(ProtocolState::Closed);
        info!(label = %self.label, ?reason, rejected, "rpc protocol closed");

        *lock(&self.close_reason) = Some(reason);
        self.on_close.fire(&reason);
    }
}

async fn dispatch_loop(shared: Arc<Shared>, mut receiver: LinkReceiver) {
    loop {
        let frame = tokio::select! {
            _ = shared.shutdown.cancelled() => break,
            frame = receiver.recv() => frame,
        };
        let Some(frame) = frame else {
            debug!(label = %shared.label, "link closed");
            shared.begin_close(CloseReason::LinkClosed);
            break;
        };

        if frame.channel == shared.rpc_channel {
            shared.handle_rpc(&frame.payload);
        } else if frame.channel == shared.control_channel {
            if shared.handle_control(&frame.payload) {
                shared.begin_close(CloseReason::RemoteGoodbye);
                break;
            }
        } else {
            warn!(
                label = %shared.label,
                channel = frame.channel,
                "dropping frame on unknown channel"
            );
        }
    }
    debug!(label = %shared.label, "dispatcher stopped");
}

fn panic_message(panic: &(dyn std::any::Any + Send)) -> String {
    if let Some(message) = panic.downcast_ref::<&str>() {
        format!("handler panicked: {message}")
    } else if let Some(message) = panic.downcast_ref::<String>() {
        format!("handler panicked: {message}")
    } else {
        "handler panicked".to_string()
    }
}
