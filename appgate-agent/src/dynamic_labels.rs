//! Periodic command execution backing dynamic labels.
//!
//! Each label runs its command on a jittered schedule and records the last
//! output. Command failures land in the label's result; they never abort
//! the agent.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use rand::Rng;
use tokio::task::JoinHandle;

use appgate_common::errors::{Error, Result};
use appgate_common::labels::CommandLabel;

fn jitter(period: Duration) -> Duration {
    let millis = period.as_millis() as u64;
    if millis == 0 {
        return period;
    }
    Duration::from_millis(rand::thread_rng().gen_range(millis / 2..=millis))
}

async fn run_command(command: &[String]) -> Result<String> {
    let (program, args) = command
        .split_first()
        .ok_or_else(|| Error::bad_parameter("dynamic label command is empty"))?;
    let output = tokio::process::Command::new(program)
        .args(args)
        .output()
        .await
        .map_err(|e| Error::Internal(anyhow::anyhow!("spawning {program:?}: {e}")))?;
    if !output.status.success() {
        return Err(Error::Internal(anyhow::anyhow!(
            "{program:?} exited with {}",
            output.status
        )));
    }
    let stdout = String::from_utf8_lossy(&output.stdout);
    Ok(stdout.lines().next().unwrap_or_default().trim().to_string())
}

/// The dynamic label pollers of one registered application.
#[derive(Debug)]
pub struct DynamicLabels {
    labels: Arc<Mutex<BTreeMap<String, CommandLabel>>>,
    handles: Vec<JoinHandle<()>>,
}

impl DynamicLabels {
    /// Validate the label specs and start one poller per label. Every label
    /// is computed once up front so the first heartbeat already carries
    /// results.
    pub async fn start(specs: &BTreeMap<String, CommandLabel>) -> Result<Self> {
        for label in specs.values() {
            label.check()?;
        }

        let labels = Arc::new(Mutex::new(specs.clone()));

        // Synchronous first computation.
        for (name, label) in specs {
            let result = match run_command(&label.command).await {
                Ok(result) => result,
                Err(error) => {
                    tracing::warn!(label = %name, %error, "dynamic label command failed");
                    error.to_string()
                }
            };
            if let Some(entry) = labels.lock().unwrap().get_mut(name) {
                entry.result = result;
            }
        }

        let mut handles = Vec::with_capacity(specs.len());
        for (name, label) in specs {
            let name = name.clone();
            let command = label.command.clone();
            let period = label.period;
            let labels = labels.clone();
            handles.push(tokio::spawn(async move {
                loop {
                    tokio::time::sleep(jitter(period)).await;
                    let result = match run_command(&command).await {
                        Ok(result) => result,
                        Err(error) => {
                            tracing::warn!(label = %name, %error, "dynamic label command failed");
                            error.to_string()
                        }
                    };
                    if let Some(entry) = labels.lock().unwrap().get_mut(&name) {
                        entry.result = result;
                    }
                }
            }));
        }

        Ok(Self { labels, handles })
    }

    /// A snapshot of the labels with their latest results.
    pub fn get(&self) -> BTreeMap<String, CommandLabel> {
        self.labels.lock().unwrap().clone()
    }

    /// Stop all pollers.
    pub fn close(&self) {
        for handle in &self.handles {
            handle.abort();
        }
    }
}

impl Drop for DynamicLabels {
    fn drop(&mut self) {
        self.close();
    }
}
