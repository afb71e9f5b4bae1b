//! InMemory UserDirectory 実装

use std::collections::HashMap;

use async_trait::async_trait;
use tokio::sync::Mutex;

use crate::domain::{DirectoryError, UserDirectory, UserId, UserProfile};

/// HashMap をユーザーテーブルとして使う UserDirectory
#[derive(Default)]
pub struct InMemoryUserDirectory {
    users: Mutex<HashMap<UserId, UserProfile>>,
}

impl InMemoryUserDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    /// ユーザーを登録（同じ ID があれば置き換える）
    pub async fn insert(&self, profile: UserProfile) {
        let mut users = self.users.lock().await;
        users.insert(profile.id.clone(), profile);
    }

    pub async fn len(&self) -> usize {
        self.users.lock().await.len()
    }
}

#[async_trait]
impl UserDirectory for InMemoryUserDirectory {
    async fn find_by_id(&self, user_id: &UserId) -> Result<Option<UserProfile>, DirectoryError> {
        let users = self.users.lock().await;
        Ok(users.get(user_id).cloned())
    }
}
