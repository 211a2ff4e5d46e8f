//! コンシューマー。
//!
//! コンシューマーグループセッションを ConnectionState として所有し、
//! 遅延接続・キャンセル可能・再開不能な MessageEnvelope の列を生成する。

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use futures::Stream;
use rdkafka::consumer::ConsumerGroupMetadata;
use rdkafka::TopicPartitionList;
use tokio_util::sync::CancellationToken;

use crate::client::{ConsumerClient, ConsumerClientFactory, KafkaConsumerClientFactory};
use crate::config::{merge_client_config, MessagingConfig, TX_CONSUMER_MANDATORY};
use crate::connection::ConnectionState;
use crate::error::MessagingError;
use crate::event::MessageEnvelope;
use crate::topic::Topic;

/// 呼び出し側が上書きできるコンシューマーの既定設定。
const CONSUMER_DEFAULTS: &[(&str, &str)] = &[
    ("session.timeout.ms", "30000"),
    ("auto.offset.reset", "earliest"),
    ("enable.auto.commit", "false"),
];

/// Consumer は 1 つのコンシューマーグループセッションを所有し、
/// 登録済みトピックのコーデックでメッセージをデコードして届ける。
///
/// 1 インスタンスは単一の呼び出し元から使用する前提で、
/// ワーカー並列化はインスタンスを分けて行う。
pub struct Consumer<T> {
    settings: HashMap<String, String>,
    topics: Vec<Arc<dyn Topic<T>>>,
    poll_timeout: Duration,
    raise_on_deserialization_error: bool,
    /// 最後に配信したメッセージの位置（commit 対象）
    positions: HashMap<(String, i32), i64>,
    conn: ConnectionState<Box<dyn ConsumerClient>>,
    factory: Box<dyn ConsumerClientFactory>,
}

impl<T> std::fmt::Debug for Consumer<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Consumer")
            .field("settings", &self.settings)
            .field("poll_timeout", &self.poll_timeout)
            .field(
                "raise_on_deserialization_error",
                &self.raise_on_deserialization_error,
            )
            .field("positions", &self.positions)
            .field("connected", &self.conn.is_connected())
            .finish_non_exhaustive()
    }
}

impl<T> Consumer<T> {
    /// 新しい Consumer を生成する。接続はまだ行わない。
    pub fn new(
        config: &MessagingConfig,
        group_id: &str,
        topics: Vec<Arc<dyn Topic<T>>>,
    ) -> Result<Self, MessagingError> {
        Self::build(
            config,
            group_id,
            topics,
            &[],
            Box::new(KafkaConsumerClientFactory),
        )
    }

    /// トランザクション参加用の Consumer を生成する。
    ///
    /// isolation.level=read_committed と enable.auto.commit=false を
    /// 必須設定として統合する。呼び出し側がどちらかを指定した場合は
    /// Configuration エラーで構築に失敗する。
    pub fn new_transactional(
        config: &MessagingConfig,
        group_id: &str,
        topics: Vec<Arc<dyn Topic<T>>>,
    ) -> Result<Self, MessagingError> {
        Self::build(
            config,
            group_id,
            topics,
            TX_CONSUMER_MANDATORY,
            Box::new(KafkaConsumerClientFactory),
        )
    }

    pub(crate) fn build(
        config: &MessagingConfig,
        group_id: &str,
        topics: Vec<Arc<dyn Topic<T>>>,
        mandatory: &[(&str, &str)],
        factory: Box<dyn ConsumerClientFactory>,
    ) -> Result<Self, MessagingError> {
        let connection = vec![
            ("bootstrap.servers".to_string(), config.bootstrap_servers()),
            (
                "security.protocol".to_string(),
                config.security_protocol.clone(),
            ),
            ("group.id".to_string(), group_id.to_string()),
        ];
        let mut settings = merge_client_config(&config.client_overrides, &connection, mandatory)?;
        for (key, value) in CONSUMER_DEFAULTS {
            settings
                .entry((*key).to_string())
                .or_insert_with(|| (*value).to_string());
        }

        Ok(Self {
            settings,
            topics,
            poll_timeout: Duration::from_millis(config.poll_timeout_ms),
            raise_on_deserialization_error: config.raise_on_deserialization_error,
            positions: HashMap::new(),
            conn: ConnectionState::Disconnected,
            factory,
        })
    }

    /// セッションを開いてトピックを購読する。接続済みの場合は何もしない。
    pub fn connect(&mut self) -> Result<(), MessagingError> {
        if self.conn.is_connected() {
            return Ok(());
        }
        let names: Vec<String> = self.topics.iter().map(|t| t.name().to_string()).collect();
        let client = self.factory.create(&self.settings, &names)?;
        tracing::info!(topics = ?names, "consumer subscribed");
        self.conn = ConnectionState::Connected(client);
        Ok(())
    }

    /// 1 回の取得試行を行う。
    ///
    /// 待機上限内にメッセージが届かなければ Ok(None) を返す（正常）。
    /// 未接続なら Disconnected、レコード単位のブローカーエラーと
    /// 未登録トピックは Message エラーを返す。
    /// デコード失敗時は設定に応じてエラー送出するか、
    /// 警告ログを残して Ok(None) を返しポーリングを継続させる
    /// （メッセージはブローカー上に残るため後から再処理できる）。
    pub async fn poll(&mut self) -> Result<Option<MessageEnvelope<T>>, MessagingError> {
        let client = self.conn.get("consumer")?;
        let Some(raw) = client.poll(self.poll_timeout).await? else {
            return Ok(None);
        };

        let topic = self
            .topics
            .iter()
            .find(|t| t.name() == raw.topic)
            .ok_or_else(|| {
                MessagingError::Message(format!("no topic registered for '{}'", raw.topic))
            })?;

        match topic.deserialize(&raw) {
            Ok(envelope) => {
                self.positions
                    .insert((raw.topic.clone(), raw.partition), raw.offset);
                Ok(Some(envelope))
            }
            Err(e) => {
                if self.raise_on_deserialization_error {
                    return Err(e);
                }
                tracing::warn!(
                    topic = %raw.topic,
                    partition = raw.partition,
                    offset = raw.offset,
                    payload = %raw.render_payload(topic.is_binary()),
                    error = %e,
                    "skipping undecodable message"
                );
                Ok(None)
            }
        }
    }

    /// 次のメッセージが届くまでポーリングを繰り返す反復プリミティブ。
    ///
    /// 初回呼び出しで接続する。各イテレーションの先頭で
    /// キャンセルトークンを確認し、キャンセル済みなら切断して
    /// Ok(None) を返す（列の終端）。poll の致命的エラーは
    /// ログに残して送出する。
    pub async fn next_message(
        &mut self,
        cancel: &CancellationToken,
    ) -> Result<Option<MessageEnvelope<T>>, MessagingError> {
        loop {
            if cancel.is_cancelled() {
                tracing::info!("cancellation observed, stopping consumer");
                self.disconnect();
                return Ok(None);
            }
            self.connect()?;
            match self.poll().await {
                Ok(Some(envelope)) => return Ok(Some(envelope)),
                Ok(None) => {
                    tracing::debug!("no message within poll timeout");
                }
                Err(e) => {
                    tracing::error!(error = %e, "consumer iteration failed");
                    return Err(e);
                }
            }
        }
    }

    /// Consumer を消費して単一パスのストリームへ変換する。
    ///
    /// 再開不能: 終端後に再度読むには新しい Consumer を生成する。
    pub fn into_stream(
        self,
        cancel: CancellationToken,
    ) -> impl Stream<Item = Result<MessageEnvelope<T>, MessagingError>> {
        futures::stream::unfold(
            (self, cancel, false),
            |(mut consumer, cancel, failed)| async move {
                if failed {
                    return None;
                }
                match consumer.next_message(&cancel).await {
                    Ok(Some(envelope)) => Some((Ok(envelope), (consumer, cancel, false))),
                    Ok(None) => None,
                    Err(e) => Some((Err(e), (consumer, cancel, true))),
                }
            },
        )
    }

    /// 最後に配信したメッセージまでのオフセットを同期コミットする。
    pub fn commit(&self) -> Result<(), MessagingError> {
        let client = self.conn.get("consumer")?;
        if self.positions.is_empty() {
            return Ok(());
        }
        let mut offsets: Vec<(String, i32, i64)> = self
            .positions
            .iter()
            .map(|((topic, partition), offset)| (topic.clone(), *partition, *offset))
            .collect();
        offsets.sort();
        client.commit(&offsets)
    }

    /// 現在の読み取り位置を返す。接続が必要。
    pub fn offsets(&self) -> Result<TopicPartitionList, MessagingError> {
        self.conn.get("consumer")?.position()
    }

    /// コンシューマーグループメタデータを返す。接続が必要。
    pub fn group_metadata(&self) -> Result<ConsumerGroupMetadata, MessagingError> {
        self.conn.get("consumer")?.group_metadata()
    }

    /// トランザクションプロデューサーがオフセット送信に使用する
    /// クライアントハンドルを返す。
    pub(crate) fn client(&self) -> Result<&dyn ConsumerClient, MessagingError> {
        self.conn.get("consumer").map(|c| c.as_ref())
    }

    /// セッションを閉じて未接続状態へ戻す。未接続なら何もしない。
    pub fn disconnect(&mut self) {
        if let Some(client) = self.conn.take() {
            client.unsubscribe();
            tracing::info!("consumer disconnected");
        }
    }
}
