// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Function module contract and interaction-model classifier.
//!
//! A function module is described by [`ModuleExports`]: the capabilities it
//! exposes, in no particular order. [`FunctionDescriptor::classify`] turns
//! that surface into a single tagged [`Invocation`] at load time; everything
//! downstream switches on the tag.
//!
//! Closures implement the capability traits directly:
//!
//! ```rust,ignore
//! use funcrun_invoker::{FunctionError, Message, ModuleExports};
//!
//! let exports = ModuleExports::new()
//!     .with_call(|msg: Message| async move { Ok::<_, FunctionError>(msg) })
//!     .with_init(|| async { Ok::<_, FunctionError>(()) });
//! ```

use std::fmt;
use std::future::Future;
use std::sync::Arc;

use async_trait::async_trait;
use futures::stream::BoxStream;
use thiserror::Error;

use crate::message::Message;

/// Inbound Messages of one Call.
pub type MessageStream = BoxStream<'static, Message>;

/// Outbound results of a duplex transform.
pub type ResultStream = BoxStream<'static, Result<Message, FunctionError>>;

/// Failure raised by user code.
#[derive(Debug, Error)]
pub enum FunctionError {
    /// The function reported an error.
    #[error("{0}")]
    Failed(String),

    /// The function panicked.
    #[error("function panicked: {0}")]
    Panicked(String),
}

impl FunctionError {
    /// Build a [`FunctionError::Failed`] from anything displayable.
    pub fn msg(message: impl fmt::Display) -> Self {
        Self::Failed(message.to_string())
    }

    pub(crate) fn from_panic(payload: Box<dyn std::any::Any + Send>) -> Self {
        let message = if let Some(s) = payload.downcast_ref::<&str>() {
            (*s).to_string()
        } else if let Some(s) = payload.downcast_ref::<String>() {
            s.clone()
        } else {
            "unknown panic payload".to_string()
        };
        Self::Panicked(message)
    }
}

impl From<anyhow::Error> for FunctionError {
    fn from(err: anyhow::Error) -> Self {
        Self::Failed(format!("{:#}", err))
    }
}

/// Single-call function: one Message in, one Message out.
#[async_trait]
pub trait RequestReply: Send + Sync {
    async fn call(&self, msg: Message) -> Result<Message, FunctionError>;
}

#[async_trait]
impl<F, Fut> RequestReply for F
where
    F: Fn(Message) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<Message, FunctionError>> + Send + 'static,
{
    async fn call(&self, msg: Message) -> Result<Message, FunctionError> {
        (self)(msg).await
    }
}

/// Duplex transform: consumes the whole inbound sequence of a Call and
/// produces the outbound sequence.
pub trait DuplexStream: Send + Sync {
    fn transform(&self, input: MessageStream) -> ResultStream;
}

impl<F> DuplexStream for F
where
    F: Fn(MessageStream) -> ResultStream + Send + Sync + 'static,
{
    fn transform(&self, input: MessageStream) -> ResultStream {
        (self)(input)
    }
}

/// `init` or `destroy` hook. Runs once, with no Message context.
#[async_trait]
pub trait LifecycleHook: Send + Sync {
    async fn run(&self) -> Result<(), FunctionError>;
}

#[async_trait]
impl<F, Fut> LifecycleHook for F
where
    F: Fn() -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<(), FunctionError>> + Send + 'static,
{
    async fn run(&self) -> Result<(), FunctionError> {
        (self)().await
    }
}

/// The exported surface of a function module.
#[derive(Clone, Default)]
pub struct ModuleExports {
    call: Option<Arc<dyn RequestReply>>,
    transform: Option<Arc<dyn DuplexStream>>,
    init: Option<Arc<dyn LifecycleHook>>,
    destroy: Option<Arc<dyn LifecycleHook>>,
    produces: Vec<String>,
}

impl fmt::Debug for ModuleExports {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ModuleExports")
            .field("call", &self.call.is_some())
            .field("transform", &self.transform.is_some())
            .field("init", &self.init.is_some())
            .field("destroy", &self.destroy.is_some())
            .field("produces", &self.produces)
            .finish()
    }
}

impl ModuleExports {
    /// An empty module. Classifies as [`InteractionModel::Unknown`].
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_call(mut self, call: impl RequestReply + 'static) -> Self {
        self.call = Some(Arc::new(call));
        self
    }

    pub fn with_transform(mut self, transform: impl DuplexStream + 'static) -> Self {
        self.transform = Some(Arc::new(transform));
        self
    }

    pub fn with_init(mut self, hook: impl LifecycleHook + 'static) -> Self {
        self.init = Some(Arc::new(hook));
        self
    }

    pub fn with_destroy(mut self, hook: impl LifecycleHook + 'static) -> Self {
        self.destroy = Some(Arc::new(hook));
        self
    }

    /// Declare a media type the function can produce.
    ///
    /// A module that declares nothing is assumed to produce anything.
    pub fn produces(mut self, media_type: impl Into<String>) -> Self {
        self.produces.push(media_type.into());
        self
    }
}

/// Calling convention implemented by a function module.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InteractionModel {
    RequestReply,
    DuplexStream,
    Unknown,
}

impl fmt::Display for InteractionModel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::RequestReply => write!(f, "request-reply"),
            Self::DuplexStream => write!(f, "duplex-stream"),
            Self::Unknown => write!(f, "unknown"),
        }
    }
}

/// Uniform adapter selected by the classifier.
#[derive(Clone)]
pub enum Invocation {
    RequestReply(Arc<dyn RequestReply>),
    DuplexStream(Arc<dyn DuplexStream>),
    Unknown,
}

impl Invocation {
    pub fn model(&self) -> InteractionModel {
        match self {
            Self::RequestReply(_) => InteractionModel::RequestReply,
            Self::DuplexStream(_) => InteractionModel::DuplexStream,
            Self::Unknown => InteractionModel::Unknown,
        }
    }
}

impl fmt::Debug for Invocation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Invocation({})", self.model())
    }
}

/// A classified function module. Immutable after [`classify`](Self::classify).
#[derive(Clone)]
pub struct FunctionDescriptor {
    invocation: Invocation,
    init: Option<Arc<dyn LifecycleHook>>,
    destroy: Option<Arc<dyn LifecycleHook>>,
    produces: Vec<String>,
}

impl FunctionDescriptor {
    /// Inspect the module's shape. Never runs user code.
    ///
    /// A duplex transform wins over a single-call function.
    pub fn classify(exports: ModuleExports) -> Self {
        let invocation = match (exports.transform, exports.call) {
            (Some(transform), _) => Invocation::DuplexStream(transform),
            (None, Some(call)) => Invocation::RequestReply(call),
            (None, None) => Invocation::Unknown,
        };

        Self {
            invocation,
            init: exports.init,
            destroy: exports.destroy,
            produces: exports.produces,
        }
    }

    pub fn model(&self) -> InteractionModel {
        self.invocation.model()
    }

    pub fn invocation(&self) -> &Invocation {
        &self.invocation
    }

    pub fn init(&self) -> Option<Arc<dyn LifecycleHook>> {
        self.init.clone()
    }

    pub fn destroy(&self) -> Option<Arc<dyn LifecycleHook>> {
        self.destroy.clone()
    }

    /// Media types the function declared it can produce.
    pub fn produces(&self) -> &[String] {
        &self.produces
    }
}

impl fmt::Debug for FunctionDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FunctionDescriptor")
            .field("model", &self.model())
            .field("init", &self.init.is_some())
            .field("destroy", &self.destroy.is_some())
            .field("produces", &self.produces)
            .finish()
    }
}
