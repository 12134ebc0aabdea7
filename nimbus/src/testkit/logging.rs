use serde::{Deserialize, Serialize};
use tokio::sync::mpsc::UnboundedReceiver;
use tokio::sync::oneshot;
use LoggerMsg::*;

#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub enum LogLevel {
  Trace,
  Debug,
  Info,
  Warn,
  Error,
  Fatal,
  Off,
}
impl LogLevel {
  pub const MIN: LogLevel = LogLevel::Trace;
}

pub enum LogSpecial {
  SentBytes(u64),
  RecvdBytes(u64),
}

pub enum LoggerMsg {
  Log(LogLevel, Box<dyn ToString + Send + 'static>),
  SetLevel(LogLevel),
  Special(LogSpecial),
  /// Replies with the byte counters and the number of lines printed.
  Stats(oneshot::Sender<(u64, u64, u64)>),
}

/// Prints log lines for one [`Cluster`](crate::cluster::Cluster). Runs as a task on the cluster's
/// runtime, fed by an unbounded channel, so logging never blocks the caller.
pub struct Logger {
  prefix: String,
  bytes_sent: u64,
  bytes_recvd: u64,
  printed: u64,
  level: LogLevel,
}
impl Logger {
  pub fn new(prefix: String, level: LogLevel) -> Self {
    Logger {
      prefix: prefix,
      bytes_sent: 0,
      bytes_recvd: 0,
      printed: 0,
      level: level,
    }
  }

  pub async fn run(mut self, mut rx: UnboundedReceiver<LoggerMsg>) {
    while let Some(msg) = rx.recv().await {
      self.recv(msg);
    }
  }

  fn recv(&mut self, msg: LoggerMsg) {
    match msg {
      Log(level, s) => {
        if level >= self.level && level != LogLevel::Off {
          self.printed += 1;
          println!("{} {:?} {}", self.prefix, level, s.to_string());
        }
      }
      SetLevel(level) => self.level = level,
      Special(s) => match s {
        LogSpecial::SentBytes(b) => self.bytes_sent += b,
        LogSpecial::RecvdBytes(b) => self.bytes_recvd += b,
      },
      Stats(tx) => {
        let _ = tx.send((self.bytes_sent, self.bytes_recvd, self.printed));
      }
    }
  }
}

#[macro_export]
macro_rules! log {
  ($level:expr, $msg_level:expr, $cluster:expr, $msg:expr) => {
    if $msg_level >= $level {
      $cluster.log($msg_level, $msg);
    }
  };
}

#[macro_export]
macro_rules! trace {
  ($level:expr, $cluster:expr, $msg:expr) => {
    $crate::log!($level, $crate::testkit::LogLevel::Trace, $cluster, $msg)
  };
}

#[macro_export]
macro_rules! debug {
  ($level:expr, $cluster:expr, $msg:expr) => {
    $crate::log!($level, $crate::testkit::LogLevel::Debug, $cluster, $msg)
  };
}

#[macro_export]
macro_rules! info {
  ($level:expr, $cluster:expr, $msg:expr) => {
    $crate::log!($level, $crate::testkit::LogLevel::Info, $cluster, $msg)
  };
}

#[macro_export]
macro_rules! warn {
  ($level:expr, $cluster:expr, $msg:expr) => {
    $crate::log!($level, $crate::testkit::LogLevel::Warn, $cluster, $msg)
  };
}

#[macro_export]
macro_rules! error {
  ($level:expr, $cluster:expr, $msg:expr) => {
    $crate::log!($level, $crate::testkit::LogLevel::Error, $cluster, $msg)
  };
}

#[macro_export]
macro_rules! fatal {
  ($level:expr, $cluster:expr, $msg:expr) => {
    $crate::log!($level, $crate::testkit::LogLevel::Fatal, $cluster, $msg)
  };
}

#[test]
fn test_logger_filters() {
  let mut logger = Logger::new("[test]".to_string(), LogLevel::Warn);
  logger.recv(Log(LogLevel::Info, Box::new("quiet")));
  logger.recv(Log(LogLevel::Error, Box::new("loud")));
  logger.recv(Special(LogSpecial::SentBytes(10)));
  logger.recv(SetLevel(LogLevel::Trace));
  logger.recv(Log(LogLevel::Debug, Box::new("now loud")));
  assert_eq!(logger.printed, 2);
  assert_eq!(logger.bytes_sent, 10);
}
