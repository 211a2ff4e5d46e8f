use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::error::MessagingError;

/// トランザクション操作（init / commit / abort / flush）の固定タイムアウト。
pub const TRANSACTION_OP_TIMEOUT_MS: u64 = 30_000;

/// プロデューサーの必須設定。
pub(crate) const PRODUCER_MANDATORY: &[(&str, &str)] = &[("request.required.acks", "all")];

/// トランザクションプロデューサーの必須設定。
/// transactional.id は呼び出し側が指定可能なため衝突検査の対象外とし、
/// 未指定の場合のみ自動生成する。
pub(crate) const TX_PRODUCER_MANDATORY: &[(&str, &str)] = &[
    ("request.required.acks", "all"),
    ("enable.idempotence", "true"),
    ("transaction.timeout.ms", "60000"),
];

/// トランザクションコンシューマーの必須設定。
/// オフセットはブローカートランザクション内でのみコミットする。
pub(crate) const TX_CONSUMER_MANDATORY: &[(&str, &str)] = &[
    ("isolation.level", "read_committed"),
    ("enable.auto.commit", "false"),
];

/// MessagingConfig は Kafka 接続設定を表す。
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MessagingConfig {
    /// Kafka ブローカーアドレスのリスト（例: ["kafka:9092"]）
    pub brokers: Vec<String>,
    /// セキュリティプロトコル（PLAINTEXT / SSL / SASL_PLAINTEXT / SASL_SSL）
    #[serde(default = "default_security_protocol")]
    pub security_protocol: String,
    /// 1 回のポーリングの待機上限（ミリ秒）
    #[serde(default = "default_poll_timeout_ms")]
    pub poll_timeout_ms: u64,
    /// 配信待機のタイムアウト（ミリ秒）
    #[serde(default = "default_delivery_timeout_ms")]
    pub delivery_timeout_ms: u64,
    /// デシリアライズ失敗時にエラーを送出するか。
    /// false の場合は警告ログを残してメッセージをスキップする。
    #[serde(default)]
    pub raise_on_deserialization_error: bool,
    /// 呼び出し側が追加指定するクライアントライブラリ設定キー
    #[serde(default)]
    pub client_overrides: HashMap<String, String>,
}

fn default_security_protocol() -> String {
    "PLAINTEXT".to_string()
}

fn default_poll_timeout_ms() -> u64 {
    1000
}

fn default_delivery_timeout_ms() -> u64 {
    30_000
}

impl MessagingConfig {
    /// ブローカーリストから最小構成の MessagingConfig を生成する。
    pub fn new(brokers: Vec<String>) -> Self {
        Self {
            brokers,
            security_protocol: default_security_protocol(),
            poll_timeout_ms: default_poll_timeout_ms(),
            delivery_timeout_ms: default_delivery_timeout_ms(),
            raise_on_deserialization_error: false,
            client_overrides: HashMap::new(),
        }
    }

    /// プロセス環境変数から接続パラメータを導出する。
    ///
    /// ARGUS_KAFKA_BROKERS（カンマ区切り、デフォルト localhost:9092）と
    /// ARGUS_KAFKA_SECURITY_PROTOCOL を参照する。
    pub fn from_env() -> Self {
        let brokers = std::env::var("ARGUS_KAFKA_BROKERS")
            .unwrap_or_else(|_| "localhost:9092".to_string())
            .split(',')
            .map(|b| b.trim().to_string())
            .filter(|b| !b.is_empty())
            .collect();
        let mut config = Self::new(brokers);
        if let Ok(protocol) = std::env::var("ARGUS_KAFKA_SECURITY_PROTOCOL") {
            config.security_protocol = protocol;
        }
        config
    }

    /// ブローカーアドレスをカンマ区切り文字列で返す（rdkafka の bootstrap.servers 用）。
    pub fn bootstrap_servers(&self) -> String {
        self.brokers.join(",")
    }
}

/// 呼び出し側設定・接続導出設定・必須設定を明示的な優先順位で統合する。
///
/// 優先順位は昇順に caller < connection < mandatory。
/// 呼び出し側のキーが必須設定と交差する場合は黙って上書きせず
/// Configuration エラーで構築を失敗させる。
pub(crate) fn merge_client_config(
    caller: &HashMap<String, String>,
    connection: &[(String, String)],
    mandatory: &[(&str, &str)],
) -> Result<HashMap<String, String>, MessagingError> {
    for key in caller.keys() {
        if mandatory.iter().any(|(k, _)| *k == key.as_str()) {
            return Err(MessagingError::Configuration(format!(
                "'{key}' collides with a mandatory setting and must not be supplied"
            )));
        }
    }

    let mut merged: HashMap<String, String> = caller.clone();
    for (key, value) in connection {
        merged.insert(key.clone(), value.clone());
    }
    for (key, value) in mandatory {
        merged.insert((*key).to_string(), (*value).to_string());
    }
    Ok(merged)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bootstrap_servers_joins_brokers() {
        let cfg = MessagingConfig::new(vec![
            "kafka-0:9092".to_string(),
            "kafka-1:9092".to_string(),
        ]);
        assert_eq!(cfg.bootstrap_servers(), "kafka-0:9092,kafka-1:9092");
    }

    #[test]
    fn test_deserialize_defaults() {
        let json = r#"{"brokers": ["kafka:9092"]}"#;
        let cfg: MessagingConfig = serde_json::from_str(json).unwrap();
        assert_eq!(cfg.security_protocol, "PLAINTEXT");
        assert_eq!(cfg.poll_timeout_ms, 1000);
        assert!(!cfg.raise_on_deserialization_error);
        assert!(cfg.client_overrides.is_empty());
    }

    #[test]
    fn test_merge_precedence() {
        let mut caller = HashMap::new();
        caller.insert("linger.ms".to_string(), "5".to_string());
        caller.insert("bootstrap.servers".to_string(), "caller:9092".to_string());

        let connection = vec![(
            "bootstrap.servers".to_string(),
            "derived:9092".to_string(),
        )];

        let merged =
            merge_client_config(&caller, &connection, PRODUCER_MANDATORY).unwrap();
        // 接続導出層が呼び出し側を上書きする
        assert_eq!(merged["bootstrap.servers"], "derived:9092");
        assert_eq!(merged["linger.ms"], "5");
        assert_eq!(merged["request.required.acks"], "all");
    }

    #[test]
    fn test_merge_rejects_mandatory_collision() {
        let mut caller = HashMap::new();
        caller.insert("request.required.acks".to_string(), "0".to_string());

        let err = merge_client_config(&caller, &[], PRODUCER_MANDATORY).unwrap_err();
        assert!(matches!(err, MessagingError::Configuration(_)));
        assert!(err.to_string().contains("request.required.acks"));
    }

    #[test]
    fn test_merge_rejects_tx_consumer_collision() {
        let mut caller = HashMap::new();
        caller.insert("isolation.level".to_string(), "read_uncommitted".to_string());

        let err = merge_client_config(&caller, &[], TX_CONSUMER_MANDATORY).unwrap_err();
        assert!(matches!(err, MessagingError::Configuration(_)));

        let mut caller = HashMap::new();
        caller.insert("enable.auto.commit".to_string(), "true".to_string());
        let err = merge_client_config(&caller, &[], TX_CONSUMER_MANDATORY).unwrap_err();
        assert!(matches!(err, MessagingError::Configuration(_)));
    }

    #[test]
    fn test_transactional_id_is_not_in_collision_set() {
        let mut caller = HashMap::new();
        caller.insert("transactional.id".to_string(), "fixed-id".to_string());

        let merged =
            merge_client_config(&caller, &[], TX_PRODUCER_MANDATORY).unwrap();
        assert_eq!(merged["transactional.id"], "fixed-id");
        assert_eq!(merged["enable.idempotence"], "true");
    }
}
