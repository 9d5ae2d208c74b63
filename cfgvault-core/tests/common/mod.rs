//! Scripted device sessions shared by the integration tests

#![allow(dead_code)]

use std::collections::VecDeque;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use cfgvault_core::device::Credentials;
use cfgvault_core::error::ConnectFailure;
use cfgvault_core::session::{CliSession, ConnectTarget, SessionConnector};
use cfgvault_core::{CaptureError, DeviceDescriptor, DeviceId, Transport, Vendor};

/// Behaviour of one scripted connection
#[derive(Clone)]
pub enum Step {
    /// Login is rejected
    AuthFail,
    /// Every command prints this text
    Reply(String),
    /// The trigger makes the device upload `content` to `file` after `delay`
    Upload {
        file: PathBuf,
        content: Vec<u8>,
        delay: Duration,
    },
    /// The trigger is accepted but nothing is ever uploaded
    Silent,
}

/// Connector that plays one [`Step`] per connection; the last step repeats
pub struct ScriptedConnector {
    steps: Mutex<VecDeque<Step>>,
    log: Arc<Mutex<Vec<String>>>,
}

impl ScriptedConnector {
    pub fn new<I: IntoIterator<Item = Step>>(steps: I) -> Arc<Self> {
        Arc::new(Self {
            steps: Mutex::new(steps.into_iter().collect()),
            log: Arc::default(),
        })
    }

    /// Everything the sessions saw, in order
    pub fn log(&self) -> Vec<String> {
        self.log.lock().unwrap().clone()
    }

    pub fn commands(&self) -> Vec<String> {
        self.log()
            .into_iter()
            .filter_map(|e| e.strip_prefix("run:").map(str::to_string))
            .collect()
    }

    pub fn connects(&self) -> usize {
        self.log().iter().filter(|e| e.starts_with("connect:")).count()
    }

    fn next_step(&self) -> Step {
        let mut steps = self.steps.lock().unwrap();
        if steps.len() > 1 {
            steps.pop_front().unwrap()
        } else {
            steps.front().cloned().unwrap()
        }
    }
}

impl SessionConnector for ScriptedConnector {
    fn connect(&self, target: &ConnectTarget) -> Result<Box<dyn CliSession>, CaptureError> {
        self.log
            .lock()
            .unwrap()
            .push(format!("connect:{}", target.endpoint()));
        match self.next_step() {
            Step::AuthFail => Err(CaptureError::connect(
                ConnectFailure::Authentication,
                target.endpoint(),
                "login rejected",
            )),
            step => Ok(Box::new(ScriptedSession {
                step,
                log: Arc::clone(&self.log),
            })),
        }
    }
}

struct ScriptedSession {
    step: Step,
    log: Arc<Mutex<Vec<String>>>,
}

impl CliSession for ScriptedSession {
    fn elevate(&mut self, _secret: &str) -> Result<(), CaptureError> {
        self.log.lock().unwrap().push("elevate".to_string());
        Ok(())
    }

    fn run(&mut self, command: &str, _timeout: Duration) -> Result<String, CaptureError> {
        self.log.lock().unwrap().push(format!("run:{command}"));
        match &self.step {
            Step::Reply(text) => Ok(text.clone()),
            _ => Err(CaptureError::capture("no output scripted")),
        }
    }

    fn trigger(&mut self, command: &str, _grace: Duration) -> Result<String, CaptureError> {
        self.log.lock().unwrap().push(format!("trigger:{command}"));
        if let Step::Upload {
            file,
            content,
            delay,
        } = self.step.clone()
        {
            std::thread::spawn(move || {
                std::thread::sleep(delay);
                std::fs::write(file, content).unwrap();
            });
        }
        Ok(String::new())
    }

    fn close(&mut self) {
        self.log.lock().unwrap().push("close".to_string());
    }
}

pub fn device(id: &str, vendor: Vendor, transport: Transport) -> DeviceDescriptor {
    DeviceDescriptor {
        id: DeviceId::new(id).unwrap(),
        name: id.to_string(),
        address: "127.0.0.1".to_string(),
        port: None,
        transport,
        vendor,
        credentials: Credentials {
            username: "backup".to_string(),
            password: "secret".to_string(),
            enable_secret: None,
        },
        active: true,
    }
}
