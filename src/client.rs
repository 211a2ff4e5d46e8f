//! クライアントライブラリ境界。
//!
//! rdkafka の接続・ポーリング・送信・トランザクションプリミティブを
//! ConsumerClient / ProducerClient トレイトの背後に置く。
//! rdkafka エラーから MessagingError への写像はすべてこのモジュールで行う。

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use rdkafka::client::ClientContext;
use rdkafka::config::ClientConfig;
use rdkafka::consumer::{
    BaseConsumer, CommitMode, Consumer, ConsumerContext, ConsumerGroupMetadata, Rebalance,
    StreamConsumer,
};
use rdkafka::error::KafkaError;
use rdkafka::message::{BorrowedMessage, Header, Headers, Message, OwnedHeaders};
use rdkafka::producer::{FutureProducer, FutureRecord, Producer};
use rdkafka::types::RDKafkaErrorCode;
use rdkafka::{Offset, TopicPartitionList};

use crate::error::{MessagingError, TxFailure};
use crate::event::{ProduceArgs, RawMessage};

/// ConsumerClient はコンシューマーグループセッションの操作インターフェース。
#[cfg_attr(any(test, feature = "mock"), mockall::automock)]
#[async_trait]
pub trait ConsumerClient: Send + Sync {
    /// 1 回の取得試行を行う。タイムアウト内にメッセージが無ければ Ok(None)。
    async fn poll(&self, timeout: Duration) -> Result<Option<RawMessage>, MessagingError>;

    /// 指定オフセットの次の位置を同期コミットする。
    fn commit(&self, offsets: &[(String, i32, i64)]) -> Result<(), MessagingError>;

    /// 現在の読み取り位置を返す（トランザクションへのオフセット送信用）。
    fn position(&self) -> Result<TopicPartitionList, MessagingError>;

    /// コンシューマーグループメタデータを返す（同上）。
    fn group_metadata(&self) -> Result<ConsumerGroupMetadata, MessagingError>;

    /// 購読を解除する。
    fn unsubscribe(&self);
}

/// ProducerClient はブローカーセッションへの送信・トランザクション操作
/// インターフェース。
#[cfg_attr(any(test, feature = "mock"), mockall::automock)]
#[async_trait]
pub trait ProducerClient: Send + Sync {
    /// シリアライズ済みメッセージを送信し、配信確認を待つ。
    async fn send(&self, args: ProduceArgs, timeout: Duration) -> Result<(), MessagingError>;

    /// バッファ済みメッセージの配信完了または失敗まで待機する。
    fn flush(&self, timeout: Duration) -> Result<(), MessagingError>;

    /// ブローカーのトランザクションサポートを初期化する。
    fn init_transactions(&self, timeout: Duration) -> Result<(), MessagingError>;

    /// トランザクションを開始する。
    fn begin_transaction(&self) -> Result<(), MessagingError>;

    /// トランザクションをコミットする。
    fn commit_transaction(&self, timeout: Duration) -> Result<(), MessagingError>;

    /// トランザクションを中断する。
    fn abort_transaction(&self, timeout: Duration) -> Result<(), MessagingError>;

    /// コンシューマーの現在オフセットとグループメタデータを
    /// 進行中のトランザクションへ送信する。
    fn send_offsets_to_transaction(
        &self,
        source: &dyn ConsumerClient,
        timeout: Duration,
    ) -> Result<(), MessagingError>;

    /// トピックのパーティション数をブローカーメタデータから取得する。
    fn partition_count(&self, topic: &str, timeout: Duration) -> Result<usize, MessagingError>;
}

/// ConsumerClientFactory は接続時に ConsumerClient を生成する。
#[cfg_attr(any(test, feature = "mock"), mockall::automock)]
pub trait ConsumerClientFactory: Send + Sync {
    /// 設定からセッションを開き、指定トピックを購読する。
    fn create(
        &self,
        settings: &HashMap<String, String>,
        topics: &[String],
    ) -> Result<Box<dyn ConsumerClient>, MessagingError>;
}

/// ProducerClientFactory は接続時に ProducerClient を生成する。
#[cfg_attr(any(test, feature = "mock"), mockall::automock)]
pub trait ProducerClientFactory: Send + Sync {
    /// 設定からブローカーセッションを開く。
    fn create(
        &self,
        settings: &HashMap<String, String>,
    ) -> Result<Box<dyn ProducerClient>, MessagingError>;
}

fn client_config(settings: &HashMap<String, String>) -> ClientConfig {
    let mut config = ClientConfig::new();
    for (key, value) in settings {
        config.set(key, value);
    }
    config
}

/// LoggingConsumerContext はパーティションの割り当て・解放を
/// ログに残すだけのリバランスコールバック。
pub struct LoggingConsumerContext;

impl ClientContext for LoggingConsumerContext {}

impl ConsumerContext for LoggingConsumerContext {
    fn pre_rebalance(&self, _consumer: &BaseConsumer<Self>, rebalance: &Rebalance<'_>) {
        match rebalance {
            Rebalance::Assign(tpl) => {
                tracing::info!(partitions = tpl.count(), "partitions assigned");
            }
            Rebalance::Revoke(tpl) => {
                tracing::info!(partitions = tpl.count(), "partitions revoked");
            }
            Rebalance::Error(e) => {
                tracing::error!(error = %e, "rebalance error");
            }
        }
    }

    fn post_rebalance(&self, _consumer: &BaseConsumer<Self>, rebalance: &Rebalance<'_>) {
        match rebalance {
            Rebalance::Assign(tpl) => {
                tracing::debug!(partitions = tpl.count(), "rebalance applied");
            }
            Rebalance::Revoke(tpl) => {
                tracing::debug!(partitions = tpl.count(), "revocation applied");
            }
            Rebalance::Error(e) => {
                tracing::error!(error = %e, "rebalance error");
            }
        }
    }
}

fn extract_headers<H: Headers>(headers: &H) -> HashMap<String, String> {
    let mut map = HashMap::with_capacity(headers.count());
    for i in 0..headers.count() {
        let header = headers.get(i);
        // 値が null のヘッダーも空文字で保持する。
        // 混在コーデックの判別はヘッダーの有無に依存するため、
        // 存在情報を落としてはならない。
        let value = header
            .value
            .map(|v| String::from_utf8_lossy(v).into_owned())
            .unwrap_or_default();
        map.insert(header.key.to_string(), value);
    }
    map
}

fn raw_message(msg: &BorrowedMessage<'_>) -> RawMessage {
    RawMessage {
        topic: msg.topic().to_string(),
        partition: msg.partition(),
        offset: msg.offset(),
        key: msg.key().map(<[u8]>::to_vec),
        payload: msg.payload().unwrap_or_default().to_vec(),
        headers: msg.headers().map(extract_headers).unwrap_or_default(),
    }
}

fn map_produce_error(topic: &str, err: &KafkaError) -> MessagingError {
    if err.rdkafka_error_code() == Some(RDKafkaErrorCode::MessageSizeTooLarge) {
        MessagingError::MessageTooLarge {
            topic: topic.to_string(),
            reason: err.to_string(),
        }
    } else {
        MessagingError::Producer(err.to_string())
    }
}

fn map_tx_error(err: KafkaError) -> MessagingError {
    let failure = match &err {
        KafkaError::Transaction(e) => TxFailure {
            message: e.to_string(),
            retriable: e.is_retriable(),
            requires_abort: e.txn_requires_abort(),
        },
        _ => TxFailure::fatal(err.to_string()),
    };
    MessagingError::Transaction(failure)
}

/// KafkaConsumerClient は rdkafka の StreamConsumer を使った実装。
pub struct KafkaConsumerClient {
    inner: StreamConsumer<LoggingConsumerContext>,
}

impl KafkaConsumerClient {
    /// 設定からセッションを開き、トピックを購読する。
    pub fn connect(
        settings: &HashMap<String, String>,
        topics: &[String],
    ) -> Result<Self, MessagingError> {
        let consumer: StreamConsumer<LoggingConsumerContext> = client_config(settings)
            .create_with_context(LoggingConsumerContext)
            .map_err(|e| MessagingError::Configuration(e.to_string()))?;

        let names: Vec<&str> = topics.iter().map(String::as_str).collect();
        consumer
            .subscribe(&names)
            .map_err(|e| MessagingError::Message(e.to_string()))?;

        Ok(Self { inner: consumer })
    }
}

#[async_trait]
impl ConsumerClient for KafkaConsumerClient {
    async fn poll(&self, timeout: Duration) -> Result<Option<RawMessage>, MessagingError> {
        match tokio::time::timeout(timeout, self.inner.recv()).await {
            // 待機上限内のメッセージ無しは正常
            Err(_) => Ok(None),
            Ok(Err(e)) => Err(MessagingError::Message(e.to_string())),
            Ok(Ok(msg)) => Ok(Some(raw_message(&msg))),
        }
    }

    fn commit(&self, offsets: &[(String, i32, i64)]) -> Result<(), MessagingError> {
        let mut tpl = TopicPartitionList::new();
        for (topic, partition, offset) in offsets {
            tpl.add_partition_offset(topic, *partition, Offset::Offset(offset + 1))
                .map_err(|e| MessagingError::Commit(e.to_string()))?;
        }
        self.inner
            .commit(&tpl, CommitMode::Sync)
            .map_err(|e| MessagingError::Commit(e.to_string()))
    }

    fn position(&self) -> Result<TopicPartitionList, MessagingError> {
        self.inner
            .position()
            .map_err(|e| MessagingError::Commit(e.to_string()))
    }

    fn group_metadata(&self) -> Result<ConsumerGroupMetadata, MessagingError> {
        self.inner
            .group_metadata()
            .ok_or_else(|| MessagingError::Commit("consumer group metadata unavailable".to_string()))
    }

    fn unsubscribe(&self) {
        self.inner.unsubscribe();
    }
}

/// KafkaConsumerClientFactory は KafkaConsumerClient を生成する既定のファクトリ。
pub struct KafkaConsumerClientFactory;

impl ConsumerClientFactory for KafkaConsumerClientFactory {
    fn create(
        &self,
        settings: &HashMap<String, String>,
        topics: &[String],
    ) -> Result<Box<dyn ConsumerClient>, MessagingError> {
        Ok(Box::new(KafkaConsumerClient::connect(settings, topics)?))
    }
}

/// KafkaProducerClient は rdkafka の FutureProducer を使った実装。
pub struct KafkaProducerClient {
    inner: FutureProducer,
}

impl KafkaProducerClient {
    /// 設定からブローカーセッションを開く。
    pub fn connect(settings: &HashMap<String, String>) -> Result<Self, MessagingError> {
        let producer: FutureProducer = client_config(settings)
            .create()
            .map_err(|e| MessagingError::Configuration(e.to_string()))?;
        Ok(Self { inner: producer })
    }
}

#[async_trait]
impl ProducerClient for KafkaProducerClient {
    async fn send(&self, args: ProduceArgs, timeout: Duration) -> Result<(), MessagingError> {
        let mut record: FutureRecord<'_, String, Vec<u8>> =
            FutureRecord::to(&args.topic).payload(&args.value);

        // キー無しはレコードに一切設定しない。
        // 空キーの明示設定は特定パーティションへ固定されるため同義ではない。
        if let Some(key) = &args.key {
            record = record.key(key);
        }

        if !args.headers.is_empty() {
            let mut headers = OwnedHeaders::new();
            for (key, value) in &args.headers {
                headers = headers.insert(Header {
                    key,
                    value: Some(value.as_bytes()),
                });
            }
            record = record.headers(headers);
        }

        match self.inner.send(record, timeout).await {
            Ok(_) => Ok(()),
            Err((err, _)) => Err(map_produce_error(&args.topic, &err)),
        }
    }

    fn flush(&self, timeout: Duration) -> Result<(), MessagingError> {
        self.inner
            .flush(timeout)
            .map_err(|e| MessagingError::Producer(e.to_string()))
    }

    fn init_transactions(&self, timeout: Duration) -> Result<(), MessagingError> {
        self.inner.init_transactions(timeout).map_err(map_tx_error)
    }

    fn begin_transaction(&self) -> Result<(), MessagingError> {
        self.inner.begin_transaction().map_err(map_tx_error)
    }

    fn commit_transaction(&self, timeout: Duration) -> Result<(), MessagingError> {
        self.inner.commit_transaction(timeout).map_err(map_tx_error)
    }

    fn abort_transaction(&self, timeout: Duration) -> Result<(), MessagingError> {
        self.inner.abort_transaction(timeout).map_err(map_tx_error)
    }

    fn send_offsets_to_transaction(
        &self,
        source: &dyn ConsumerClient,
        timeout: Duration,
    ) -> Result<(), MessagingError> {
        let offsets = source.position()?;
        let metadata = source.group_metadata()?;
        self.inner
            .send_offsets_to_transaction(&offsets, &metadata, timeout)
            .map_err(map_tx_error)
    }

    fn partition_count(&self, topic: &str, timeout: Duration) -> Result<usize, MessagingError> {
        let metadata = self
            .inner
            .client()
            .fetch_metadata(Some(topic), timeout)
            .map_err(|e| MessagingError::Producer(e.to_string()))?;
        Ok(metadata
            .topics()
            .iter()
            .find(|t| t.name() == topic && t.error().is_none())
            .map(|t| t.partitions().len())
            .unwrap_or(0))
    }
}

/// KafkaProducerClientFactory は KafkaProducerClient を生成する既定のファクトリ。
pub struct KafkaProducerClientFactory;

impl ProducerClientFactory for KafkaProducerClientFactory {
    fn create(
        &self,
        settings: &HashMap<String, String>,
    ) -> Result<Box<dyn ProducerClient>, MessagingError> {
        Ok(Box::new(KafkaProducerClient::connect(settings)?))
    }
}
