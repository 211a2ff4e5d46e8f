/// TxFailure はブローカートランザクション失敗の分類情報を表す。
///
/// rdkafka が報告する retriable / abort 必須の分類を保持し、
/// トランザクションスコープが abort するかどうかの判断に使用する。
#[derive(Debug, Clone)]
pub struct TxFailure {
    /// ブローカーが報告したエラーメッセージ
    pub message: String,
    /// リトライ可能なエラーかどうか
    pub retriable: bool,
    /// トランザクションの abort が必須かどうか
    pub requires_abort: bool,
}

impl TxFailure {
    /// 分類情報を持たない失敗（クライアント都合のエラー等）を生成する。
    pub fn fatal(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            retriable: false,
            requires_abort: false,
        }
    }

    /// abort すべき失敗かどうかを返す。
    pub fn should_abort(&self) -> bool {
        self.retriable || self.requires_abort
    }
}

impl std::fmt::Display for TxFailure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{} (retriable: {}, requires_abort: {})",
            self.message, self.retriable, self.requires_abort
        )
    }
}

/// MessagingError はメッセージング層の全エラーを表す。
#[derive(Debug, thiserror::Error)]
pub enum MessagingError {
    /// 呼び出し側の設定が必須設定と衝突した（構築時に検出）。
    #[error("configuration error: {0}")]
    Configuration(String),

    /// 未接続状態で connect 以外の操作が呼ばれた。
    #[error("{0} is not connected")]
    Disconnected(&'static str),

    /// オフセットコミットに失敗した。
    #[error("offset commit failed: {0}")]
    Commit(String),

    /// ブローカーがレコード単位のエラーを報告した、
    /// またはレコードのトピックが登録済みトピックに一致しなかった。
    #[error("message error: {0}")]
    Message(String),

    /// ペイロードまたはヘッダーがトピックのコーデック契約に従っていない。
    /// 再処理のためにトピック・パーティション・オフセットを保持する。
    #[error("deserialization failed on {topic}[{partition}]@{offset}: {reason}")]
    Deserialization {
        topic: String,
        partition: i32,
        offset: i64,
        reason: String,
    },

    /// 送信イベントをコーデック契約に従ってエンコードできなかった。
    #[error("serialization failed for topic {topic}: {reason}")]
    Serialization { topic: String, reason: String },

    /// ブローカーがメッセージサイズ超過を報告した。
    /// 分割・破棄などの対処のため一般の Producer エラーと区別する。
    #[error("message too large for topic {topic}: {reason}")]
    MessageTooLarge { topic: String, reason: String },

    /// メッセージ配信に失敗した（非トランザクション経路）。
    #[error("produce failed: {0}")]
    Producer(String),

    /// トランザクション中の失敗。abort 判断の分類情報を伴う。
    #[error("transaction failed: {0}")]
    Transaction(TxFailure),
}
