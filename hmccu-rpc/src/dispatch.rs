use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::RwLock;

use hmccu_proto::{Error, Fault, Query, Value};

/// A registered method implementation. Receives the call's parameters
/// already re-wrapped as a single array value and returns either the
/// result or an error -- never a raw fault; fault shaping happens once,
/// in [`Dispatcher::dispatch`].
#[async_trait]
pub trait Handler: Send + Sync {
    async fn call(&self, params: &Value) -> Result<Value, Error>;
}

/// Holds the `name -> handler` registry and dispatches calls to it,
/// including the reserved `system.*` built-ins. Dispatch is strictly
/// sequential per call; any concurrency is imposed by the caller (the
/// HTTP/TCP fronts run one dispatch per connection/request).
pub struct Dispatcher {
    handlers: RwLock<HashMap<String, Arc<dyn Handler>>>,
    catch_all: RwLock<Option<Arc<dyn Handler>>>,
}

impl Default for Dispatcher {
    fn default() -> Self {
        Self::new()
    }
}

impl Dispatcher {
    pub fn new() -> Self {
        Dispatcher {
            handlers: RwLock::new(HashMap::new()),
            catch_all: RwLock::new(None),
        }
    }

    pub async fn handle(&self, name: impl Into<String>, handler: Arc<dyn Handler>) {
        self.handlers.write().await.insert(name.into(), handler);
    }

    pub async fn handle_unknown(&self, handler: Arc<dyn Handler>) {
        *self.catch_all.write().await = Some(handler);
    }

    /// Every registered name plus the three built-ins, each appearing
    /// exactly once.
    pub async fn list_methods(&self) -> Vec<String> {
        let mut names: Vec<String> = self.handlers.read().await.keys().cloned().collect();
        names.push("system.listMethods".to_string());
        names.push("system.multicall".to_string());
        names.push("system.methodHelp".to_string());
        names
    }

    /// Dispatches one call, shaping any error into a [`Fault`]: a
    /// handler-raised [`Error::MethodError`] keeps its code/message,
    /// every other error becomes code -1.
    pub async fn dispatch(&self, name: &str, params: Value) -> Result<Value, Fault> {
        self.dispatch_inner(name, params)
            .await
            .map_err(|e| Fault::from(&e))
    }

    async fn dispatch_inner(&self, name: &str, params: Value) -> Result<Value, Error> {
        match name {
            "system.listMethods" => Ok(Value::Array(
                self.list_methods().await.into_iter().map(Value::String).collect(),
            )),
            "system.methodHelp" => Ok(Value::String(String::new())),
            "system.multicall" => self.multicall(&params).await,
            _ => {
                let handler = self.handlers.read().await.get(name).cloned();
                let handler = match handler {
                    Some(h) => Some(h),
                    None => self.catch_all.read().await.clone(),
                };
                match handler {
                    Some(h) => h.call(&params).await,
                    None => Err(Error::NotFound(name.to_string())),
                }
            }
        }
    }

    /// `system.multicall`: dispatches each `{methodName, params}`
    /// element in order. On the first element failure the whole batch
    /// returns that single error, discarding any earlier successes --
    /// this mirrors the Controller's own behavior (see the open
    /// question on multicall partial failure) rather than aggregating
    /// per-element faults.
    async fn multicall(&self, params: &Value) -> Result<Value, Error> {
        let q = Query::new(params);
        let calls = q.index(0).array();
        if let Some(e) = q.error() {
            return Err(e);
        }

        let mut results = Vec::with_capacity(calls.len());
        for call in &calls {
            let method = call.key("methodName").string();
            let inner_params = call.key("params").value().clone();
            if let Some(e) = call.error() {
                return Err(e);
            }

            let result = Box::pin(self.dispatch_inner(&method, inner_params)).await?;
            results.push(result);
        }
        Ok(Value::Array(results))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Echo;

    #[async_trait]
    impl Handler for Echo {
        async fn call(&self, params: &Value) -> Result<Value, Error> {
            Ok(Query::new(params).index(0).value().clone())
        }
    }

    struct AlwaysFails;

    #[async_trait]
    impl Handler for AlwaysFails {
        async fn call(&self, _params: &Value) -> Result<Value, Error> {
            Err(Error::MethodError {
                code: 7,
                message: "nope".into(),
            })
        }
    }

    #[tokio::test]
    async fn list_methods_includes_builtins_and_registered_names() {
        let d = Dispatcher::new();
        d.handle("echo", Arc::new(Echo)).await;

        let names = d.list_methods().await;
        assert!(names.contains(&"echo".to_string()));
        assert!(names.contains(&"system.listMethods".to_string()));
        assert!(names.contains(&"system.multicall".to_string()));
    }

    #[tokio::test]
    async fn method_error_keeps_code_and_message() {
        let d = Dispatcher::new();
        d.handle("boom", Arc::new(AlwaysFails)).await;

        let fault = d
            .dispatch("boom", Value::Array(vec![]))
            .await
            .unwrap_err();
        assert_eq!(fault.code, 7);
        assert_eq!(fault.message, "nope");
    }

    #[tokio::test]
    async fn unknown_method_becomes_code_minus_one() {
        let d = Dispatcher::new();
        let fault = d
            .dispatch("nope.nope", Value::Array(vec![]))
            .await
            .unwrap_err();
        assert_eq!(fault.code, -1);
    }

    #[tokio::test]
    async fn multicall_preserves_distinct_scalar_kinds() {
        let d = Dispatcher::new();
        d.handle("echo", Arc::new(Echo)).await;

        let batch = Value::Array(vec![Value::Array(vec![
            Value::struct_from(vec![
                ("methodName".to_string(), Value::String("echo".into())),
                (
                    "params".to_string(),
                    Value::Array(vec![Value::String("Hello world!".into())]),
                ),
            ]),
            Value::struct_from(vec![
                ("methodName".to_string(), Value::String("echo".into())),
                ("params".to_string(), Value::Array(vec![Value::Int(123)])),
            ]),
        ])]);

        let result = d.dispatch("system.multicall", batch).await.unwrap();
        assert_eq!(
            result,
            Value::Array(vec![
                Value::String("Hello world!".into()),
                Value::Int(123),
            ])
        );
    }

    #[tokio::test]
    async fn multicall_discards_earlier_successes_on_failure() {
        let d = Dispatcher::new();
        d.handle("echo", Arc::new(Echo)).await;
        d.handle("boom", Arc::new(AlwaysFails)).await;

        let batch = Value::Array(vec![Value::Array(vec![
            Value::struct_from(vec![
                ("methodName".to_string(), Value::String("echo".into())),
                ("params".to_string(), Value::Array(vec![Value::Int(1)])),
            ]),
            Value::struct_from(vec![
                ("methodName".to_string(), Value::String("boom".into())),
                ("params".to_string(), Value::Array(vec![])),
            ]),
        ])]);

        let fault = d.dispatch("system.multicall", batch).await.unwrap_err();
        assert_eq!(fault.code, 7);
    }
}
