use std::collections::HashMap;
use std::marker::PhantomData;

use crate::error::MessagingError;
use crate::event::{Event, MessageEnvelope, ProduceArgs, RawMessage};

/// バイナリエンコードされたメッセージに付与するヘッダーキー。
pub const CONTENT_TYPE_HEADER: &str = "Content-Type";
/// バイナリエンコードされたメッセージの Content-Type 値。
pub const MSGPACK_CONTENT_TYPE: &str = "application/msgpack";

/// システム全体で使用するチャネル名。
/// 命名規則: argus.{domain}.{event-type}.{version}
pub mod names {
    /// 識別済みイベントチャネル（混在コーデック）
    pub const IDENTIFIED_EVENTS: &str = "argus.ingest.identified.v1";
    /// 未識別イベントチャネル（JSON コーデック）
    pub const UNIDENTIFIED_EVENTS: &str = "argus.ingest.unidentified.v1";
    /// スケジュールイベントチャネル（バイナリコーデック）
    pub const SCHEDULED_EVENTS: &str = "argus.ingest.scheduled.v1";
    /// 処理不能メッセージのデッドレターチャネル（JSON コーデック）
    pub const DEAD_LETTER: &str = "argus.ingest.deadletter.v1";
}

/// Topic は名前付きチャネルとそのシリアライズ契約を表す。
///
/// serialize は受理型の正しいペイロードに対して失敗しない。
/// deserialize はペイロードやヘッダーが契約に合致しない場合、
/// トピック・パーティション・オフセットを保持した
/// Deserialization エラーを返す。
pub trait Topic<T>: Send + Sync {
    /// ブローカー上のチャネル識別子を返す。
    fn name(&self) -> &str;

    /// ペイロードが非 UTF-8 かどうかを返す（ログ出力形式の判定に使用）。
    fn is_binary(&self) -> bool;

    /// ペイロードをエンコードして送信パラメータへ変換する。
    fn serialize(&self, payload: &T) -> Result<ProduceArgs, MessagingError>;

    /// 受信レコードをデコードしてエンベロープへ変換する。
    fn deserialize(&self, raw: &RawMessage) -> Result<MessageEnvelope<T>, MessagingError>;
}

fn decode_failure(raw: &RawMessage, reason: impl std::fmt::Display) -> MessagingError {
    MessagingError::Deserialization {
        topic: raw.topic.clone(),
        partition: raw.partition,
        offset: raw.offset,
        reason: reason.to_string(),
    }
}

fn envelope<T>(raw: &RawMessage, payload: T) -> MessageEnvelope<T> {
    MessageEnvelope {
        payload,
        topic: raw.topic.clone(),
        partition: raw.partition,
        offset: raw.offset,
        headers: raw.headers.clone(),
        key: raw.key_string(),
    }
}

fn json_args<E: Event>(name: &str, payload: &E) -> Result<ProduceArgs, MessagingError> {
    let value = serde_json::to_vec(payload).map_err(|e| MessagingError::Serialization {
        topic: name.to_string(),
        reason: e.to_string(),
    })?;
    Ok(ProduceArgs {
        topic: name.to_string(),
        value,
        headers: HashMap::new(),
        key: payload.partition_key(),
    })
}

fn msgpack_args<P: Event>(name: &str, payload: &P) -> Result<ProduceArgs, MessagingError> {
    let value = rmp_serde::to_vec_named(payload).map_err(|e| MessagingError::Serialization {
        topic: name.to_string(),
        reason: e.to_string(),
    })?;
    let mut headers = HashMap::new();
    headers.insert(
        CONTENT_TYPE_HEADER.to_string(),
        MSGPACK_CONTENT_TYPE.to_string(),
    );
    Ok(ProduceArgs {
        topic: name.to_string(),
        value,
        headers,
        key: payload.partition_key(),
    })
}

/// JsonTopic は常に UTF-8 JSON でエンコードするトピック。ヘッダーは付与しない。
pub struct JsonTopic<E> {
    name: String,
    _marker: PhantomData<fn() -> E>,
}

impl<E> JsonTopic<E> {
    /// 指定した名前の JsonTopic を生成する。
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            _marker: PhantomData,
        }
    }
}

impl<E: Event> Topic<E> for JsonTopic<E> {
    fn name(&self) -> &str {
        &self.name
    }

    fn is_binary(&self) -> bool {
        false
    }

    fn serialize(&self, payload: &E) -> Result<ProduceArgs, MessagingError> {
        json_args(&self.name, payload)
    }

    fn deserialize(&self, raw: &RawMessage) -> Result<MessageEnvelope<E>, MessagingError> {
        let payload: E =
            serde_json::from_slice(&raw.payload).map_err(|e| decode_failure(raw, e))?;
        Ok(envelope(raw, payload))
    }
}

/// BinaryTopic は常に msgpack でエンコードするトピック。
/// Content-Type ヘッダーでタグ付けする。
pub struct BinaryTopic<P> {
    name: String,
    _marker: PhantomData<fn() -> P>,
}

impl<P> BinaryTopic<P> {
    /// 指定した名前の BinaryTopic を生成する。
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            _marker: PhantomData,
        }
    }
}

impl<P: Event> Topic<P> for BinaryTopic<P> {
    fn name(&self) -> &str {
        &self.name
    }

    fn is_binary(&self) -> bool {
        true
    }

    fn serialize(&self, payload: &P) -> Result<ProduceArgs, MessagingError> {
        msgpack_args(&self.name, payload)
    }

    fn deserialize(&self, raw: &RawMessage) -> Result<MessageEnvelope<P>, MessagingError> {
        let payload: P = rmp_serde::from_slice(&raw.payload).map_err(|e| decode_failure(raw, e))?;
        Ok(envelope(raw, payload))
    }
}

/// MixedPayload は混在トピックが受理する 2 系統のペイロードを表す。
///
/// Event はドメインイベント（JSON）、Binary は汎用ペイロード（msgpack）。
/// エンコード方式の選択はこのバリアントで決まる。
#[derive(Debug, Clone, PartialEq)]
pub enum MixedPayload<E, P> {
    /// ドメインイベント。JSON でエンコードされる。
    Event(E),
    /// 汎用ペイロード。msgpack でエンコードされる。
    Binary(P),
}

/// MixedTopic は JSON とバイナリの両方のメッセージを運ぶ互換チャネル。
///
/// serialize 時はペイロードのバリアントでエンコードを選択し、
/// deserialize 時はヘッダーの有無で分岐する:
/// ヘッダーなし => JSON、ヘッダーあり => msgpack。
/// このヘッダー判別は既発行メッセージとのワイヤ互換のための
/// 暫定仕様であり、内容検査に置き換えてはならない。
pub struct MixedTopic<E, P> {
    name: String,
    _marker: PhantomData<fn() -> (E, P)>,
}

impl<E, P> MixedTopic<E, P> {
    /// 指定した名前の MixedTopic を生成する。
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            _marker: PhantomData,
        }
    }
}

impl<E: Event, P: Event> Topic<MixedPayload<E, P>> for MixedTopic<E, P> {
    fn name(&self) -> &str {
        &self.name
    }

    fn is_binary(&self) -> bool {
        true
    }

    fn serialize(&self, payload: &MixedPayload<E, P>) -> Result<ProduceArgs, MessagingError> {
        match payload {
            MixedPayload::Event(event) => json_args(&self.name, event),
            MixedPayload::Binary(binary) => msgpack_args(&self.name, binary),
        }
    }

    fn deserialize(
        &self,
        raw: &RawMessage,
    ) -> Result<MessageEnvelope<MixedPayload<E, P>>, MessagingError> {
        if raw.headers.is_empty() {
            let payload: E =
                serde_json::from_slice(&raw.payload).map_err(|e| decode_failure(raw, e))?;
            Ok(envelope(raw, MixedPayload::Event(payload)))
        } else {
            let payload: P =
                rmp_serde::from_slice(&raw.payload).map_err(|e| decode_failure(raw, e))?;
            Ok(envelope(raw, MixedPayload::Binary(payload)))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::{Deserialize, Serialize};

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    struct IngestEvent {
        source_id: String,
        name: String,
        value: f64,
    }

    impl Event for IngestEvent {
        fn partition_key(&self) -> Option<String> {
            Some(self.source_id.clone())
        }
    }

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    struct MetricBatch {
        series: Vec<u64>,
    }

    impl Event for MetricBatch {
        fn partition_key(&self) -> Option<String> {
            None
        }
    }

    fn sample_event() -> IngestEvent {
        IngestEvent {
            source_id: "p1".to_string(),
            name: "cpu.usage".to_string(),
            value: 0.75,
        }
    }

    fn raw_from_args(args: &ProduceArgs) -> RawMessage {
        RawMessage {
            topic: args.topic.clone(),
            partition: 0,
            offset: 100,
            key: args.key.as_ref().map(|k| k.as_bytes().to_vec()),
            payload: args.value.clone(),
            headers: args.headers.clone(),
        }
    }

    #[test]
    fn test_json_topic_round_trip() {
        let topic: JsonTopic<IngestEvent> = JsonTopic::new(names::UNIDENTIFIED_EVENTS);
        let event = sample_event();

        let args = topic.serialize(&event).unwrap();
        assert_eq!(args.topic, names::UNIDENTIFIED_EVENTS);
        assert!(args.headers.is_empty());
        assert_eq!(args.key.as_deref(), Some("p1"));

        let envelope = topic.deserialize(&raw_from_args(&args)).unwrap();
        assert_eq!(envelope.payload, event);
        assert_eq!(envelope.offset, 100);
        assert_eq!(envelope.key.as_deref(), Some("p1"));
    }

    #[test]
    fn test_binary_topic_round_trip() {
        let topic: BinaryTopic<MetricBatch> = BinaryTopic::new(names::SCHEDULED_EVENTS);
        let batch = MetricBatch {
            series: vec![1, 2, 3],
        };

        let args = topic.serialize(&batch).unwrap();
        assert_eq!(
            args.headers.get(CONTENT_TYPE_HEADER).map(String::as_str),
            Some(MSGPACK_CONTENT_TYPE)
        );
        // partition_key が None のキーは省略される
        assert!(args.key.is_none());

        let envelope = topic.deserialize(&raw_from_args(&args)).unwrap();
        assert_eq!(envelope.payload, batch);
    }

    #[test]
    fn test_mixed_topic_event_branch_round_trip() {
        let topic: MixedTopic<IngestEvent, MetricBatch> =
            MixedTopic::new(names::IDENTIFIED_EVENTS);
        let payload = MixedPayload::Event(sample_event());

        let args = topic.serialize(&payload).unwrap();
        // ドメインイベントは JSON、ヘッダーなし
        assert!(args.headers.is_empty());

        let envelope = topic.deserialize(&raw_from_args(&args)).unwrap();
        assert_eq!(envelope.payload, payload);
    }

    #[test]
    fn test_mixed_topic_binary_branch_round_trip() {
        let topic: MixedTopic<IngestEvent, MetricBatch> =
            MixedTopic::new(names::IDENTIFIED_EVENTS);
        let payload = MixedPayload::Binary(MetricBatch { series: vec![9] });

        let args = topic.serialize(&payload).unwrap();
        assert_eq!(
            args.headers.get(CONTENT_TYPE_HEADER).map(String::as_str),
            Some(MSGPACK_CONTENT_TYPE)
        );

        let envelope = topic.deserialize(&raw_from_args(&args)).unwrap();
        assert_eq!(envelope.payload, payload);
    }

    #[test]
    fn test_mixed_topic_dispatches_on_header_presence_only() {
        let topic: MixedTopic<IngestEvent, MetricBatch> =
            MixedTopic::new(names::IDENTIFIED_EVENTS);

        // JSON ペイロードでも任意のヘッダーがあれば msgpack 経路に入り、失敗する
        let json_payload = serde_json::to_vec(&sample_event()).unwrap();
        let mut headers = HashMap::new();
        headers.insert("X-Anything".to_string(), "1".to_string());
        let raw = RawMessage {
            topic: names::IDENTIFIED_EVENTS.to_string(),
            partition: 2,
            offset: 5,
            key: None,
            payload: json_payload,
            headers,
        };

        let err = topic.deserialize(&raw).unwrap_err();
        match err {
            MessagingError::Deserialization {
                topic: t,
                partition,
                offset,
                ..
            } => {
                assert_eq!(t, names::IDENTIFIED_EVENTS);
                assert_eq!(partition, 2);
                assert_eq!(offset, 5);
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn test_mixed_topic_empty_valued_header_selects_binary_branch() {
        let topic: MixedTopic<IngestEvent, MetricBatch> =
            MixedTopic::new(names::IDENTIFIED_EVENTS);
        let batch = MetricBatch { series: vec![4, 2] };

        // 値なしヘッダーはクライアント層で空文字として届くが、
        // 存在する以上 msgpack 経路が選ばれる
        let mut headers = HashMap::new();
        headers.insert("X-Tombstone".to_string(), String::new());
        let raw = RawMessage {
            topic: names::IDENTIFIED_EVENTS.to_string(),
            partition: 0,
            offset: 11,
            key: None,
            payload: rmp_serde::to_vec_named(&batch).unwrap(),
            headers,
        };

        let envelope = topic.deserialize(&raw).unwrap();
        assert_eq!(envelope.payload, MixedPayload::Binary(batch));
    }

    #[test]
    fn test_json_topic_decode_failure_carries_position() {
        let topic: JsonTopic<IngestEvent> = JsonTopic::new(names::UNIDENTIFIED_EVENTS);
        let raw = RawMessage {
            topic: names::UNIDENTIFIED_EVENTS.to_string(),
            partition: 1,
            offset: 77,
            key: None,
            payload: b"not json".to_vec(),
            headers: HashMap::new(),
        };

        let err = topic.deserialize(&raw).unwrap_err();
        assert!(matches!(
            err,
            MessagingError::Deserialization {
                partition: 1,
                offset: 77,
                ..
            }
        ));
    }
}
