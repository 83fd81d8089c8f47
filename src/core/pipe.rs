//! 有界管道：后台生产者 + 带截止时间的拉取
//!
//! 远程列举、本地遍历和比较器的输出都走这一套：生产者在队列满时一直阻塞，
//! 直到消费者取走或离开；消费者每次拉取最多等待 `deadline`，超时返回
//! [`SyncError::Timeout`]，不会无限挂起。

use std::time::Duration;
use tokio::sync::mpsc;
use tracing::trace;

use crate::error::{Result, SyncError};

/// 创建一条容量为 `capacity` 的管道
pub fn pipe<T>(name: impl Into<String>, capacity: usize, deadline: Duration) -> (PipeSender<T>, Pipe<T>) {
    let (tx, rx) = mpsc::channel(capacity.max(1));
    let name = name.into();
    (
        PipeSender {
            tx,
            name: name.clone(),
        },
        Pipe { rx, deadline, name },
    )
}

/// 生产者一端
pub struct PipeSender<T> {
    tx: mpsc::Sender<T>,
    name: String,
}

impl<T> PipeSender<T> {
    /// 发送一个元素，队列满时阻塞
    ///
    /// 消费者处理得再慢也只是等待；返回 `false` 表示消费者已经离开，
    /// 生产者应当停止。
    pub async fn send(&self, item: T) -> bool {
        if self.tx.send(item).await.is_err() {
            trace!("{} 的消费者已离开", self.name);
            return false;
        }
        true
    }

    /// 同步上下文（`spawn_blocking`）中使用的发送
    pub fn blocking_send(&self, item: T) -> bool {
        if self.tx.blocking_send(item).is_err() {
            trace!("{} 的消费者已离开", self.name);
            return false;
        }
        true
    }
}

/// 消费者一端
pub struct Pipe<T> {
    rx: mpsc::Receiver<T>,
    deadline: Duration,
    name: String,
}

impl<T> Pipe<T> {
    /// 拉取下一个元素
    ///
    /// `Ok(None)` 表示所有生产者都已退出。
    pub async fn recv(&mut self) -> Result<Option<T>> {
        match tokio::time::timeout(self.deadline, self.rx.recv()).await {
            Ok(item) => Ok(item),
            Err(_) => Err(SyncError::Timeout {
                what: self.name.clone(),
                secs: self.deadline.as_secs(),
            }),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }
}
