use crate::error::MessagingError;

/// ConnectionState は接続ハンドルの有無を明示的に表す直和型。
///
/// null 許容のハンドルの代わりに用い、未接続状態での操作は
/// ハンドル参照の失敗ではなく MessagingError::Disconnected として
/// 即座に失敗させる。
pub enum ConnectionState<C> {
    /// 接続済み。クライアントハンドルを保持する。
    Connected(C),
    /// 未接続。
    Disconnected,
}

impl<C> ConnectionState<C> {
    /// 接続済みかどうかを返す。
    pub fn is_connected(&self) -> bool {
        matches!(self, Self::Connected(_))
    }

    /// 接続済みハンドルへの参照を返す。
    /// 未接続の場合は Disconnected エラーを返す（component はエラー表示用）。
    pub fn get(&self, component: &'static str) -> Result<&C, MessagingError> {
        match self {
            Self::Connected(client) => Ok(client),
            Self::Disconnected => Err(MessagingError::Disconnected(component)),
        }
    }

    /// ハンドルを取り出して未接続状態へ戻す。未接続なら None。
    pub fn take(&mut self) -> Option<C> {
        match std::mem::replace(self, Self::Disconnected) {
            Self::Connected(client) => Some(client),
            Self::Disconnected => None,
        }
    }
}

impl<C> Default for ConnectionState<C> {
    fn default() -> Self {
        Self::Disconnected
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_disconnected_get_fails() {
        let state: ConnectionState<u32> = ConnectionState::Disconnected;
        assert!(!state.is_connected());
        let err = state.get("consumer").unwrap_err();
        assert!(matches!(err, MessagingError::Disconnected("consumer")));
    }

    #[test]
    fn test_connected_get_returns_handle() {
        let state = ConnectionState::Connected(42u32);
        assert!(state.is_connected());
        assert_eq!(*state.get("producer").unwrap(), 42);
    }

    #[test]
    fn test_take_is_idempotent() {
        let mut state = ConnectionState::Connected(1u32);
        assert_eq!(state.take(), Some(1));
        assert!(!state.is_connected());
        assert_eq!(state.take(), None);
    }
}
