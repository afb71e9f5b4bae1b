//! 受信メッセージの有界キュー
//!
//! 容量はメッセージと一緒に運ばれるセマフォの permit で守ります。
//! permit は消費側が処理を終えてから返すため、保存中のメッセージも容量に数えます。

use std::sync::Arc;

use tokio::sync::{OwnedSemaphorePermit, Semaphore, mpsc};

use crate::{domain::MessageContent, usecase::error::RuntimeError};

#[derive(Debug)]
pub struct QueuedMessage {
    pub content: MessageContent,
    _permit: OwnedSemaphorePermit,
}

/// 送り側。セッションの受信処理が持つ
pub struct MessageQueue {
    tx: mpsc::UnboundedSender<QueuedMessage>,
    gauge: QueueGauge,
}

pub struct MessageQueueReceiver {
    rx: mpsc::UnboundedReceiver<QueuedMessage>,
}

/// キューの使用状況の読み取り専用ビュー
#[derive(Clone)]
pub struct QueueGauge {
    permits: Arc<Semaphore>,
    capacity: usize,
}

pub fn message_queue(capacity: usize) -> (MessageQueue, MessageQueueReceiver) {
    let (tx, rx) = mpsc::unbounded_channel();
    let gauge = QueueGauge {
        permits: Arc::new(Semaphore::new(capacity)),
        capacity,
    };
    (MessageQueue { tx, gauge }, MessageQueueReceiver { rx })
}

impl MessageQueue {
    /// 待たずに積む。満杯なら新しいメッセージを拒否する
    pub fn try_enqueue(&self, content: MessageContent) -> Result<(), RuntimeError> {
        let permit = self
            .gauge
            .permits
            .clone()
            .try_acquire_owned()
            .map_err(|_| RuntimeError::QueueFull)?;
        self.tx
            .send(QueuedMessage {
                content,
                _permit: permit,
            })
            .map_err(|_| RuntimeError::DownstreamUnavailable("message consumer stopped".into()))
    }

    pub fn gauge(&self) -> QueueGauge {
        self.gauge.clone()
    }
}

impl MessageQueueReceiver {
    pub async fn recv(&mut self) -> Option<QueuedMessage> {
        self.rx.recv().await
    }
}

impl QueueGauge {
    /// 積まれているか処理中のメッセージ数
    pub fn len(&self) -> usize {
        self.capacity
            .saturating_sub(self.permits.available_permits())
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn fill_ratio(&self) -> f64 {
        if self.capacity == 0 {
            return 1.0;
        }
        self.len() as f64 / self.capacity as f64
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn content(text: &str) -> MessageContent {
        MessageContent::new(text.to_string()).unwrap()
    }

    #[tokio::test]
    async fn test_overflow_rejects_newest_message() {
        // テスト項目: 容量を超えた最新のメッセージだけが拒否される
        // given (前提条件):
        let (queue, _rx) = message_queue(2);
        queue.try_enqueue(content("one")).unwrap();
        queue.try_enqueue(content("two")).unwrap();

        // when (操作):
        let result = queue.try_enqueue(content("three"));

        // then (期待する結果):
        assert_eq!(result, Err(RuntimeError::QueueFull));
        assert_eq!(queue.gauge().len(), 2);
    }

    #[tokio::test]
    async fn test_message_in_flight_still_counts_toward_capacity() {
        // テスト項目: 取り出し済みでも処理中のメッセージは容量に数えられる
        // given (前提条件):
        let (queue, mut rx) = message_queue(1);
        queue.try_enqueue(content("one")).unwrap();

        // when (操作):
        let in_flight = rx.recv().await.unwrap();
        let while_processing = queue.try_enqueue(content("two"));
        drop(in_flight);
        let after_processing = queue.try_enqueue(content("three"));

        // then (期待する結果):
        assert_eq!(while_processing, Err(RuntimeError::QueueFull));
        assert!(after_processing.is_ok());
    }

    #[tokio::test]
    async fn test_fill_ratio_and_fifo_order() {
        // テスト項目: 充填率が計算され、取り出しは到着順
        // given (前提条件):
        let (queue, mut rx) = message_queue(4);
        for text in ["a", "b", "c"] {
            queue.try_enqueue(content(text)).unwrap();
        }

        // when (操作):
        let ratio = queue.gauge().fill_ratio();
        let first = rx.recv().await.unwrap();

        // then (期待する結果):
        assert_eq!(ratio, 0.75);
        assert_eq!(first.content.as_str(), "a");
    }
}
