// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Fixture function modules.
//!
//! Each fixture exercises one lifecycle path of the invoker. They are served
//! by the `funcrun-fixtures` binary and selected with `FUNCRUN_FUNCTION_URI`,
//! exactly like the stock binary's built-ins.
//!
//! | Locator | Shape | Expected exit |
//! |---------|-------|---------------|
//! | `echo`, `echo-stream` | built-ins | 0 on SIGINT |
//! | `lifecycle` | request-reply, temp file created by `init`, removed by `destroy` | 0 on SIGINT |
//! | `slow-init` | request-reply, `init` takes about a second | 0 on SIGINT |
//! | `init-throws` | `init` returns an error | 2 |
//! | `init-panics` | `init` panics | 2 |
//! | `init-timeout` | `init` never settles | 1 |
//! | `init-blocks` | `init` blocks its worker thread | 1 |
//! | `destroy-throws` | `destroy` returns an error | 2 after SIGINT |
//! | `destroy-timeout` | `destroy` never settles | 1 after SIGINT |
//! | `bogus-interaction-model` | hooks only, no call or transform | 255 |

use std::path::PathBuf;
use std::time::Duration;

use funcrun_invoker::{FunctionError, FunctionRegistry, Message, ModuleExports, builtin};
use tracing::info;
use uuid::Uuid;

/// Registry with the built-ins and every fixture.
pub fn registry() -> FunctionRegistry {
    let mut registry = FunctionRegistry::with_builtins();
    registry
        .register("lifecycle", lifecycle)
        .register("slow-init", slow_init)
        .register("init-throws", init_throws)
        .register("init-panics", init_panics)
        .register("init-timeout", init_timeout)
        .register("init-blocks", init_blocks)
        .register("destroy-throws", destroy_throws)
        .register("destroy-timeout", destroy_timeout)
        .register("bogus-interaction-model", bogus_interaction_model);
    registry
}

/// `init` writes a nonce to a fresh temp file, each call reports the file
/// and the nonce as JSON, `destroy` removes the file.
pub fn lifecycle() -> ModuleExports {
    let nonce = Uuid::new_v4().to_string();
    let file: PathBuf = std::env::temp_dir().join(format!("funcrun-lifecycle-{}", nonce));

    let init_file = file.clone();
    let init_nonce = nonce.clone();
    let call_file = file.clone();
    let call_nonce = nonce;
    let destroy_file = file;

    ModuleExports::new()
        .produces("application/json")
        .with_init(move || {
            let file = init_file.clone();
            let nonce = init_nonce.clone();
            async move {
                tokio::fs::write(&file, nonce)
                    .await
                    .map_err(FunctionError::msg)?;
                info!(file = %file.display(), "nonce file created");
                Ok::<_, FunctionError>(())
            }
        })
        .with_call(move |_msg: Message| {
            let body = serde_json::json!({
                "file": call_file.display().to_string(),
                "content": call_nonce,
            });
            async move {
                let payload = serde_json::to_vec(&body).map_err(FunctionError::msg)?;
                Ok::<_, FunctionError>(Message::builder().payload(payload).build())
            }
        })
        .with_destroy(move || {
            let file = destroy_file.clone();
            async move {
                tokio::fs::remove_file(&file)
                    .await
                    .map_err(FunctionError::msg)?;
                info!(file = %file.display(), "nonce file removed");
                Ok::<_, FunctionError>(())
            }
        })
}

pub fn slow_init() -> ModuleExports {
    builtin::echo().with_init(|| async {
        tokio::time::sleep(Duration::from_millis(1500)).await;
        Ok::<_, FunctionError>(())
    })
}

pub fn init_throws() -> ModuleExports {
    builtin::echo().with_init(|| async { Err::<(), _>(FunctionError::msg("init failed on purpose")) })
}

pub fn init_panics() -> ModuleExports {
    fn explode() -> Result<(), FunctionError> {
        panic!("init panicked on purpose")
    }
    builtin::echo().with_init(|| async { explode() })
}

pub fn init_timeout() -> ModuleExports {
    builtin::echo().with_init(|| async {
        std::future::pending::<()>().await;
        Ok::<_, FunctionError>(())
    })
}

/// Blocks the worker thread instead of yielding; the timeout must still win.
pub fn init_blocks() -> ModuleExports {
    builtin::echo().with_init(|| async {
        std::thread::sleep(Duration::from_secs(3600));
        Ok::<_, FunctionError>(())
    })
}

pub fn destroy_throws() -> ModuleExports {
    builtin::echo()
        .with_destroy(|| async { Err::<(), _>(FunctionError::msg("destroy failed on purpose")) })
}

pub fn destroy_timeout() -> ModuleExports {
    builtin::echo().with_destroy(|| async {
        std::future::pending::<()>().await;
        Ok::<_, FunctionError>(())
    })
}

/// Lifecycle hooks but no invocation shape.
pub fn bogus_interaction_model() -> ModuleExports {
    ModuleExports::new()
        .with_init(|| async { Ok::<_, FunctionError>(()) })
        .with_destroy(|| async { Ok::<_, FunctionError>(()) })
}

#[cfg(test)]
mod tests {
    use super::*;
    use funcrun_invoker::{FunctionDescriptor, InteractionModel};

    #[test]
    fn test_registry_contains_every_fixture() {
        let registry = registry();
        let names: Vec<_> = registry.names().collect();
        for name in [
            "echo",
            "echo-stream",
            "lifecycle",
            "slow-init",
            "init-throws",
            "init-panics",
            "init-timeout",
            "init-blocks",
            "destroy-throws",
            "destroy-timeout",
            "bogus-interaction-model",
        ] {
            assert!(names.contains(&name), "missing fixture {}", name);
        }
    }

    #[test]
    fn test_bogus_fixture_is_unknown() {
        let exports = registry().load("builtin:bogus-interaction-model").unwrap();
        assert_eq!(
            FunctionDescriptor::classify(exports).model(),
            InteractionModel::Unknown
        );
    }

    #[tokio::test]
    async fn test_lifecycle_hooks_manage_nonce_file() {
        use funcrun_invoker::function::Invocation;
        use funcrun_invoker::{LifecycleHook, RequestReply};

        let descriptor = FunctionDescriptor::classify(lifecycle());
        assert_eq!(descriptor.produces(), &["application/json"]);

        descriptor.init().unwrap().run().await.unwrap();

        let Invocation::RequestReply(call) = descriptor.invocation() else {
            panic!("lifecycle fixture should be request-reply");
        };
        let reply = call.call(Message::default()).await.unwrap();
        let body: serde_json::Value = serde_json::from_slice(reply.payload()).unwrap();
        let file = PathBuf::from(body["file"].as_str().unwrap());
        assert_eq!(
            std::fs::read_to_string(&file).unwrap(),
            body["content"].as_str().unwrap()
        );

        descriptor.destroy().unwrap().run().await.unwrap();
        assert!(!file.exists());
    }

    #[tokio::test]
    async fn test_destroy_without_init_fails() {
        use funcrun_invoker::LifecycleHook;

        // No file was ever written
        let descriptor = FunctionDescriptor::classify(lifecycle());
        assert!(descriptor.destroy().unwrap().run().await.is_err());
    }
}
