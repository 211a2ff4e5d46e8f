use std::collections::HashMap;

use serde::de::DeserializeOwned;
use serde::Serialize;

/// Event はトピック経由で送受信されるドメインペイロードの共通インターフェース。
///
/// serde でシリアライズ可能であることに加え、パーティション割り当てに
/// 使用するキーを公開する。
pub trait Event: Serialize + DeserializeOwned + Send + Sync {
    /// パーティションキーを返す。
    ///
    /// None の場合、キーはレコードに一切設定されず、ブローカー側で
    /// パーティション間に負荷分散される。空文字のキーを設定すると
    /// 特定パーティションへ固定配置されるため、None と空文字は区別する。
    fn partition_key(&self) -> Option<String>;
}

/// ProduceArgs はシリアライズ済みメッセージとクライアントライブラリへ
/// 渡す送信パラメータを表す。
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProduceArgs {
    /// 送信先トピック名
    pub topic: String,
    /// エンコード済みペイロード
    pub value: Vec<u8>,
    /// メッセージヘッダー
    pub headers: HashMap<String, String>,
    /// パーティションキー。None はキー省略（空文字とは異なる）。
    pub key: Option<String>,
}

/// MessageEnvelope はデコード済みペイロードと配信メタデータを保持する
/// 不変の値型を表す。
#[derive(Debug, Clone, PartialEq)]
pub struct MessageEnvelope<T> {
    /// デコード済みペイロード
    pub payload: T,
    /// 受信元トピック名
    pub topic: String,
    /// パーティション番号
    pub partition: i32,
    /// オフセット
    pub offset: i64,
    /// メッセージヘッダー
    pub headers: HashMap<String, String>,
    /// メッセージキー
    pub key: Option<String>,
}

/// RawMessage はブローカーから受信した未デコードのレコードを表す。
/// Topic::deserialize の入力となる。
#[derive(Debug, Clone)]
pub struct RawMessage {
    /// 受信元トピック名
    pub topic: String,
    /// パーティション番号
    pub partition: i32,
    /// オフセット
    pub offset: i64,
    /// メッセージキー（バイト列）
    pub key: Option<Vec<u8>>,
    /// ペイロード（バイト列）
    pub payload: Vec<u8>,
    /// メッセージヘッダー
    pub headers: HashMap<String, String>,
}

impl RawMessage {
    /// キーを UTF-8 文字列として返す（非 UTF-8 は損失変換）。
    pub fn key_string(&self) -> Option<String> {
        self.key
            .as_ref()
            .map(|k| String::from_utf8_lossy(k).into_owned())
    }

    /// ログ出力用にペイロードを安全な文字列へ変換する。
    /// バイナリトピックは 16 進ダンプ、それ以外は UTF-8 損失変換。
    pub fn render_payload(&self, binary: bool) -> String {
        if binary {
            self.payload.iter().map(|b| format!("{b:02x}")).collect()
        } else {
            String::from_utf8_lossy(&self.payload).into_owned()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn make_raw(payload: Vec<u8>, key: Option<Vec<u8>>) -> RawMessage {
        RawMessage {
            topic: "argus.ingest.unidentified.v1".to_string(),
            partition: 0,
            offset: 7,
            key,
            payload,
            headers: HashMap::new(),
        }
    }

    #[test]
    fn test_key_string() {
        let raw = make_raw(vec![], Some(b"tenant-1".to_vec()));
        assert_eq!(raw.key_string().as_deref(), Some("tenant-1"));

        let raw = make_raw(vec![], None);
        assert!(raw.key_string().is_none());
    }

    #[test]
    fn test_render_payload_utf8() {
        let raw = make_raw(b"{\"a\":1}".to_vec(), None);
        assert_eq!(raw.render_payload(false), "{\"a\":1}");
    }

    #[test]
    fn test_render_payload_hex() {
        let raw = make_raw(vec![0xde, 0xad, 0xbe, 0xef], None);
        assert_eq!(raw.render_payload(true), "deadbeef");
    }
}
