//! Callable handles for exposed methods.

use super::Farm;
use super::task::{CallOptions, PendingCall};
use crate::error::Result;
use serde::de::DeserializeOwned;
use serde_json::Value;
use tokio::sync::mpsc;

/// One exposed method of a [`Farm`], callable like a function.
///
/// ```ignore
/// let double = farm.proxy("double")?;
/// let four: i64 = double.call_as(vec![json!(2)]).await?;
/// ```
#[derive(Debug, Clone)]
pub struct MethodProxy<'a> {
    farm: &'a Farm,
    method: String,
}

impl<'a> MethodProxy<'a> {
    pub(crate) fn new(farm: &'a Farm, method: &str) -> Self {
        Self {
            farm,
            method: method.to_string(),
        }
    }

    pub fn name(&self) -> &str {
        &self.method
    }

    /// Start the call without waiting for it.
    pub fn dispatch(&self, args: Vec<Value>) -> Result<PendingCall> {
        self.farm.call(&self.method, args)
    }

    pub async fn call(&self, args: Vec<Value>) -> Result<Value> {
        self.dispatch(args)?.await
    }

    /// Call and decode the result into `R`.
    pub async fn call_as<R: DeserializeOwned>(&self, args: Vec<Value>) -> Result<R> {
        let value = self.call(args).await?;
        Ok(serde_json::from_value(value)?)
    }

    /// Start the call and hand back the custom messages it emits along with
    /// the pending result. The receiver closes once the call settles.
    pub fn call_with_messages(
        &self,
        args: Vec<Value>,
    ) -> Result<(PendingCall, mpsc::UnboundedReceiver<Value>)> {
        let (tx, rx) = mpsc::unbounded_channel();
        let pending = self
            .farm
            .call_with(&self.method, args, CallOptions::new().with_messages(tx))?;
        Ok((pending, rx))
    }
}
