use anyhow::{anyhow, Result};
use async_trait::async_trait;
use std::sync::Arc;
use tracing::warn;

use crate::connection::ObjectConnection;

#[async_trait]
pub trait Stoppable: Send + Sync {
    async fn stop(&self) -> Result<()>;
}

#[async_trait]
impl Stoppable for ObjectConnection {
    async fn stop(&self) -> Result<()> {
        ObjectConnection::stop(self).await;
        Ok(())
    }
}

/// Stops its members in order. A failing member does not prevent the rest
/// from stopping; all failures are reported together.
#[derive(Default, Clone)]
pub struct CompositeStoppable {
    members: Vec<(String, Arc<dyn Stoppable>)>,
}

impl CompositeStoppable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(mut self, name: impl Into<String>, member: Arc<dyn Stoppable>) -> Self {
        self.members.push((name.into(), member));
        self
    }

    pub fn push(&mut self, name: impl Into<String>, member: Arc<dyn Stoppable>) {
        self.members.push((name.into(), member));
    }

    pub fn len(&self) -> usize {
        self.members.len()
    }

    pub fn is_empty(&self) -> bool {
        self.members.is_empty()
    }
}

#[async_trait]
impl Stoppable for CompositeStoppable {
    async fn stop(&self) -> Result<()> {
        let mut failures = Vec::new();
        for (name, member) in &self.members {
            if let Err(err) = member.stop().await {
                warn!(member = %name, error = %err, "failed to stop");
                failures.push(format!("{name}: {err:#}"));
            }
        }
        match failures.len() {
            0 => Ok(()),
            1 => Err(anyhow!("failed to stop {}", failures.remove(0))),
            n => Err(anyhow!(
                "failed to stop {n} components: {}",
                failures.join("; ")
            )),
        }
    }
}
