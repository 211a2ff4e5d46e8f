//! プロデューサー。
//!
//! 通常配信とトランザクション配信の両方を担う。トランザクションは
//! begin → ブロック実行 → flush →（オフセット送信）→ commit の
//! スコープとして提供し、失敗時はブローカー分類に従って中断する。

use std::collections::HashMap;
use std::future::Future;
use std::time::Duration;

use uuid::Uuid;

use crate::client::{
    ConsumerClient, KafkaProducerClientFactory, ProducerClient, ProducerClientFactory,
};
use crate::config::{
    merge_client_config, MessagingConfig, PRODUCER_MANDATORY, TRANSACTION_OP_TIMEOUT_MS,
    TX_PRODUCER_MANDATORY,
};
use crate::connection::ConnectionState;
use crate::consumer::Consumer;
use crate::error::MessagingError;
use crate::topic::Topic;

/// 呼び出し側が上書きできるプロデューサーの既定設定。
const PRODUCER_DEFAULTS: &[(&str, &str)] = &[("message.timeout.ms", "30000")];

/// Producer は 1 つの配信セッションを所有する。
///
/// new_transactional で生成した場合のみトランザクション API が
/// 利用でき、接続時に一意な transactional.id でブローカーへ
/// 登録される。
pub struct Producer {
    settings: HashMap<String, String>,
    delivery_timeout: Duration,
    op_timeout: Duration,
    transactional: bool,
    conn: ConnectionState<Box<dyn ProducerClient>>,
    factory: Box<dyn ProducerClientFactory>,
}

impl std::fmt::Debug for Producer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Producer")
            .field("settings", &self.settings)
            .field("delivery_timeout", &self.delivery_timeout)
            .field("op_timeout", &self.op_timeout)
            .field("transactional", &self.transactional)
            .field("connected", &self.conn.is_connected())
            .finish_non_exhaustive()
    }
}

impl Producer {
    /// 新しい Producer を生成する。接続はまだ行わない。
    pub fn new(config: &MessagingConfig) -> Result<Self, MessagingError> {
        Self::build(config, false, Box::new(KafkaProducerClientFactory))
    }

    /// トランザクション対応の Producer を生成する。
    ///
    /// request.required.acks=all / enable.idempotence=true を必須設定
    /// として統合し、transactional.id が未指定なら UUID で自動生成する。
    pub fn new_transactional(config: &MessagingConfig) -> Result<Self, MessagingError> {
        Self::build(config, true, Box::new(KafkaProducerClientFactory))
    }

    fn build(
        config: &MessagingConfig,
        transactional: bool,
        factory: Box<dyn ProducerClientFactory>,
    ) -> Result<Self, MessagingError> {
        let connection = vec![
            ("bootstrap.servers".to_string(), config.bootstrap_servers()),
            (
                "security.protocol".to_string(),
                config.security_protocol.clone(),
            ),
        ];
        let mandatory = if transactional {
            TX_PRODUCER_MANDATORY
        } else {
            PRODUCER_MANDATORY
        };
        let mut settings = merge_client_config(&config.client_overrides, &connection, mandatory)?;
        for (key, value) in PRODUCER_DEFAULTS {
            settings
                .entry((*key).to_string())
                .or_insert_with(|| (*value).to_string());
        }
        if transactional {
            settings
                .entry("transactional.id".to_string())
                .or_insert_with(|| format!("argus-messaging-{}", Uuid::new_v4()));
        }

        Ok(Self {
            settings,
            delivery_timeout: Duration::from_millis(config.delivery_timeout_ms),
            op_timeout: Duration::from_millis(TRANSACTION_OP_TIMEOUT_MS),
            transactional,
            conn: ConnectionState::Disconnected,
            factory,
        })
    }

    /// クライアントを生成し、トランザクション対応なら
    /// init_transactions を実行する。接続済みの場合は何もしない。
    pub fn connect(&mut self) -> Result<(), MessagingError> {
        if self.conn.is_connected() {
            return Ok(());
        }
        let client = self.factory.create(&self.settings)?;
        if self.transactional {
            // 初期化は Disconnected → Connected の遷移時のみ
            client.init_transactions(self.op_timeout)?;
        }
        tracing::info!(transactional = self.transactional, "producer connected");
        self.conn = ConnectionState::Connected(client);
        Ok(())
    }

    /// イベントをトピックのコーデックで直列化して配信し、
    /// 配信結果が確定するまで待機する。
    pub async fn produce<T>(
        &self,
        topic: &dyn Topic<T>,
        event: &T,
    ) -> Result<(), MessagingError> {
        let client = self.conn.get("producer")?;
        let args = topic.serialize(event)?;
        tracing::debug!(topic = %args.topic, "producing message");
        client.send(args, self.delivery_timeout).await
    }

    /// トピックがブローカー上に存在し、パーティションを
    /// 1 つ以上持つかを照会する。
    pub fn is_topic_available(
        &self,
        topic: &str,
        timeout: Duration,
    ) -> Result<bool, MessagingError> {
        let client = self.conn.get("producer")?;
        Ok(client.partition_count(topic, timeout)? > 0)
    }

    /// バッファ済みメッセージの配信完了まで待機する。
    pub fn flush(&self) -> Result<(), MessagingError> {
        self.conn.get("producer")?.flush(self.delivery_timeout)
    }

    /// トランザクションを開始する。
    pub fn begin_transaction(&self) -> Result<(), MessagingError> {
        self.tx_client()?.begin_transaction()
    }

    /// 進行中のトランザクションをコミットする。
    pub fn commit_transaction(&self) -> Result<(), MessagingError> {
        self.tx_client()?.commit_transaction(self.op_timeout)
    }

    /// 進行中のトランザクションを中断する。
    pub fn abort_transaction(&self) -> Result<(), MessagingError> {
        self.tx_client()?.abort_transaction(self.op_timeout)
    }

    /// コンシューマーの現在オフセットを進行中のトランザクションへ
    /// 送信する。コミットが成功した場合のみオフセットが確定する。
    pub fn send_consumer_offsets<T>(
        &self,
        consumer: &Consumer<T>,
    ) -> Result<(), MessagingError> {
        self.tx_client()?
            .send_offsets_to_transaction(consumer.client()?, self.op_timeout)
    }

    /// ブロックをトランザクションスコープで実行する。
    ///
    /// ブロック成功時は flush してコミットし、ブロックの戻り値を返す。
    /// 失敗時はブローカー分類に従って中断し、元のエラーを送出する。
    pub async fn transaction<R, Fut>(
        &self,
        block: impl FnOnce() -> Fut,
    ) -> Result<R, MessagingError>
    where
        Fut: Future<Output = Result<R, MessagingError>>,
    {
        self.run_transaction(None, block).await
    }

    /// ブロックをトランザクションスコープで実行し、コミット直前に
    /// コンシューマーのオフセットをトランザクションへ送信する。
    ///
    /// 消費位置の確定と配信が単一のアトミック操作になる。
    pub async fn transaction_with_offsets<T, R, Fut>(
        &self,
        consumer: &Consumer<T>,
        block: impl FnOnce() -> Fut,
    ) -> Result<R, MessagingError>
    where
        Fut: Future<Output = Result<R, MessagingError>>,
    {
        self.run_transaction(Some(consumer.client()?), block).await
    }

    async fn run_transaction<R, Fut>(
        &self,
        offsets: Option<&dyn ConsumerClient>,
        block: impl FnOnce() -> Fut,
    ) -> Result<R, MessagingError>
    where
        Fut: Future<Output = Result<R, MessagingError>>,
    {
        let client = self.tx_client()?;
        let outcome = async {
            client.begin_transaction()?;
            let value = block().await?;
            client.flush(self.delivery_timeout)?;
            if let Some(source) = offsets {
                client.send_offsets_to_transaction(source, self.op_timeout)?;
            }
            client.commit_transaction(self.op_timeout)?;
            Ok(value)
        }
        .await;

        match outcome {
            Ok(value) => Ok(value),
            Err(MessagingError::Transaction(failure)) => {
                // リトライ可能または中断必須と分類された場合は abort する。
                // トランザクションをスコープ境界を越えて開いたままにしない。
                if failure.should_abort() {
                    if let Err(abort_err) = client.abort_transaction(self.op_timeout) {
                        tracing::error!(error = %abort_err, "transaction abort failed");
                    } else {
                        tracing::warn!(reason = %failure, "transaction aborted");
                    }
                }
                Err(MessagingError::Transaction(failure))
            }
            Err(other) => {
                // ブロック自体の失敗は無条件に中断し、元のエラーを返す
                tracing::warn!(error = %other, "aborting transaction");
                if let Err(abort_err) = client.abort_transaction(self.op_timeout) {
                    tracing::error!(error = %abort_err, "transaction abort failed");
                }
                Err(other)
            }
        }
    }

    fn tx_client(&self) -> Result<&dyn ProducerClient, MessagingError> {
        if !self.transactional {
            return Err(MessagingError::Configuration(
                "producer is not transactional".to_string(),
            ));
        }
        self.conn.get("producer").map(|c| c.as_ref())
    }

    /// 残りのメッセージを flush してからセッションを解放する。
    /// 未接続なら何もしない。
    pub fn disconnect(&mut self) -> Result<(), MessagingError> {
        if let Some(client) = self.conn.take() {
            let flushed = client.flush(self.delivery_timeout);
            tracing::info!("producer disconnected");
            flushed?;
        }
        Ok(())
    }
}
