//! Group setup between the master and its workers.
//!
//! One plain TCP connection per worker carries newline-delimited JSON. The
//! worker says where its task listener is, the master answers with the full
//! membership and the program, and task 0 reports back once the run is over.

use std::io::{BufRead, BufReader, Write};
use std::net::TcpStream;

use anyhow::{Context, Result, bail};
use serde::{Deserialize, Serialize};
use tracing::trace;

use crate::addr::TaskId;
use crate::config::RuntimeConfig;
use crate::error::TaskError;
use crate::program::Program;
use crate::value::Value;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum BootMsg {
    Hello {
        listen: String,
    },
    Setup {
        tid: TaskId,
        members: Vec<String>,
        program: Program,
        config: RuntimeConfig,
    },
    Finished {
        result: Result<Value, TaskError>,
        output: Vec<u8>,
    },
}

#[derive(Debug)]
pub struct BootChannel {
    reader: BufReader<TcpStream>,
    writer: TcpStream,
}

impl BootChannel {
    pub fn new(stream: TcpStream) -> Result<Self> {
        let writer = stream.try_clone().context("failed to clone bootstrap stream")?;
        Ok(Self {
            reader: BufReader::new(stream),
            writer,
        })
    }

    pub fn connect(addr: &str) -> Result<Self> {
        let stream = TcpStream::connect(addr).with_context(|| format!("failed to reach master at {}", addr))?;
        Self::new(stream)
    }

    pub fn send(&mut self, msg: &BootMsg) -> Result<()> {
        let mut line = serde_json::to_string(msg).context("failed to encode bootstrap message")?;
        line.push('\n');
        self.writer
            .write_all(line.as_bytes())
            .context("failed to send bootstrap message")?;
        self.writer.flush().context("failed to flush bootstrap stream")?;
        trace!(target: "nreduce::group", len = line.len(), "boot.sent");
        Ok(())
    }

    pub fn recv(&mut self) -> Result<BootMsg> {
        let mut line = String::new();
        let n = self
            .reader
            .read_line(&mut line)
            .context("failed to read bootstrap message")?;
        if n == 0 {
            bail!("bootstrap peer closed the connection");
        }
        serde_json::from_str(line.trim_end()).context("malformed bootstrap message")
    }

    pub fn peer(&self) -> String {
        self.writer
            .peer_addr()
            .map(|a| a.to_string())
            .unwrap_or_else(|_| "?".into())
    }
}
