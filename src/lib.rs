//! argus-messaging
//!
//! Kafka 上のイベント送受信を担うメッセージング層。
//!
//! - 型付きトピックコーデック（JSON / MessagePack / 混在）
//! - 遅延接続とキャンセル可能な反復を備えたコンシューマー
//! - 消費オフセット確定と配信をアトミックに行う
//!   トランザクションプロデューサー
//!
//! ブローカークライアントはトレイト境界（ConsumerClient /
//! ProducerClient）で分離しており、`mock` フィーチャーで
//! テスト用モックを公開する。

pub mod client;
pub mod config;
pub mod connection;
pub mod consumer;
pub mod error;
pub mod event;
pub mod producer;
pub mod shutdown;
pub mod topic;

pub use client::{
    ConsumerClient, ConsumerClientFactory, KafkaConsumerClient, KafkaConsumerClientFactory,
    KafkaProducerClient, KafkaProducerClientFactory, ProducerClient, ProducerClientFactory,
};
pub use config::{MessagingConfig, TRANSACTION_OP_TIMEOUT_MS};
pub use connection::ConnectionState;
pub use consumer::Consumer;
pub use error::{MessagingError, TxFailure};
pub use event::{Event, MessageEnvelope, ProduceArgs, RawMessage};
pub use producer::Producer;
pub use shutdown::shutdown_token;
pub use topic::{
    names, BinaryTopic, JsonTopic, MixedPayload, MixedTopic, Topic, CONTENT_TYPE_HEADER,
    MSGPACK_CONTENT_TYPE,
};

#[cfg(feature = "mock")]
pub use client::{
    MockConsumerClient, MockConsumerClientFactory, MockProducerClient, MockProducerClientFactory,
};
