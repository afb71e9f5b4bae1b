//! PresenceRegistry: 接続状態の唯一の管理主体
//!
//! ## 責務
//!
//! - connection_id → [`ConnectionRecord`] の正引きマップと、
//!   room → connection_id 集合 / user → connection_id 集合の逆引きインデックスを保持
//! - 接続数の上限（ユーザー単位・ルーム単位・全体）を強制
//! - 最終アクティビティが古い接続の掃除（stale sweep）
//!
//! ## 並行性
//!
//! 3 つの構造と上限値は 1 つの `parking_lot::Mutex` の内側にあり、
//! 上限チェックと挿入、削除とインデックス更新は同じクリティカルセクションで行います。
//! クリティカルセクション内で I/O や `.await` は行いません。
//!
//! 各エントリは [`EvictSignal`] を持ち、掃除・重複接続・シャットダウンによる
//! 退去をセッション側に通知します。トランスポートを閉じるのはセッションの責務です。
//!
//! オンライン・オフライン通知は [`PresenceRegistry::lock_presence`] で
//! (user, room) ごとに直列化します。オフラインにするかどうかは
//! [`PresenceRegistry::depart`] が削除と同じクリティカルセクションで判定します。

use std::{
    collections::{BTreeMap, BTreeSet, HashMap, HashSet},
    hash::{BuildHasher, RandomState},
    sync::{Arc, OnceLock},
    time::Duration,
};

use irori_shared::time::Clock;
use parking_lot::Mutex;
use thiserror::Error;
use tokio::{
    sync::{Mutex as AsyncMutex, MutexGuard as AsyncMutexGuard, Notify},
    task::JoinHandle,
    time::MissedTickBehavior,
};
use tokio_util::sync::CancellationToken;

use crate::domain::{ConnectionId, ConnectionMetadata, ConnectionRecord, RoomId, Timestamp, UserId};

use super::error::CapacityKind;

/// 在室通知ロックのストライプ数
const PRESENCE_STRIPES: usize = 64;

/// 接続数の上限
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RegistryLimits {
    pub per_user: usize,
    pub per_room: usize,
    pub global: usize,
}

impl Default for RegistryLimits {
    fn default() -> Self {
        Self {
            per_user: 5,
            per_room: 100,
            global: 1000,
        }
    }
}

/// 登録がセッションに退去を通知した理由
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EvictReason {
    /// 同じユーザー・ルームの新しい接続が待っている
    Replaced,
    /// 最終アクティビティが閾値より古い
    Stale,
    /// セッション以外の誰かが登録を外した
    Removed,
    Shutdown,
}

/// 登録の持ち主のセッションに渡す一度きりの退去通知
#[derive(Debug)]
pub struct EvictSignal {
    token: CancellationToken,
    reason: OnceLock<EvictReason>,
}

impl EvictSignal {
    fn new(token: CancellationToken) -> Self {
        Self {
            token,
            reason: OnceLock::new(),
        }
    }

    /// 通知を発火する。最初の理由が優先される
    pub fn fire(&self, reason: EvictReason) {
        let _ = self.reason.set(reason);
        self.token.cancel();
    }

    pub fn is_fired(&self) -> bool {
        self.token.is_cancelled()
    }

    /// 発火するまで待ち、理由を返す
    pub async fn fired(&self) -> EvictReason {
        self.token.cancelled().await;
        self.reason()
    }

    pub fn reason(&self) -> EvictReason {
        // ルートトークン経由のキャンセルには理由が付かない
        self.reason.get().copied().unwrap_or(EvictReason::Shutdown)
    }
}

/// [`PresenceRegistry::admit`] が接続を拒否した理由
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum AdmitRejection {
    #[error("{0} connection limit reached")]
    Capacity(CapacityKind),
    #[error("connection {0} already holds this user and room")]
    Occupied(ConnectionId),
    #[error("connection id {0} is already registered")]
    DuplicateId(ConnectionId),
    #[error("registry is shutting down")]
    ShuttingDown,
}

/// ある時点の登録状況のスナップショット
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RegistryStats {
    pub total_connections: usize,
    pub room_counts: BTreeMap<RoomId, usize>,
    pub user_counts: BTreeMap<UserId, usize>,
}

impl RegistryStats {
    pub fn total_rooms(&self) -> usize {
        self.room_counts.len()
    }

    pub fn total_users(&self) -> usize {
        self.user_counts.len()
    }
}

struct Entry {
    record: ConnectionRecord,
    signal: Arc<EvictSignal>,
}

#[derive(Default)]
struct Indices {
    connections: HashMap<ConnectionId, Entry>,
    rooms: HashMap<RoomId, HashSet<ConnectionId>>,
    users: HashMap<UserId, HashSet<ConnectionId>>,
    limits: RegistryLimits,
}

impl Indices {
    fn room_count(&self, room_id: &RoomId) -> usize {
        self.rooms.get(room_id).map_or(0, HashSet::len)
    }

    fn user_count(&self, user_id: &UserId) -> usize {
        self.users.get(user_id).map_or(0, HashSet::len)
    }

    fn check_capacity(&self, user_id: &UserId, room_id: &RoomId) -> Result<(), CapacityKind> {
        if self.connections.len() >= self.limits.global {
            return Err(CapacityKind::Global);
        }
        if self.room_count(room_id) >= self.limits.per_room {
            return Err(CapacityKind::Room);
        }
        if self.user_count(user_id) >= self.limits.per_user {
            return Err(CapacityKind::User);
        }
        Ok(())
    }

    fn find_pair(&self, user_id: &UserId, room_id: &RoomId) -> Option<ConnectionId> {
        self.users.get(user_id)?.iter().copied().find(|id| {
            self.connections
                .get(id)
                .is_some_and(|entry| &entry.record.room_id == room_id)
        })
    }

    fn insert(&mut self, entry: Entry) {
        let id = entry.record.connection_id;
        self.rooms
            .entry(entry.record.room_id.clone())
            .or_default()
            .insert(id);
        self.users
            .entry(entry.record.user_id.clone())
            .or_default()
            .insert(id);
        self.connections.insert(id, entry);
    }

    fn remove(&mut self, connection_id: &ConnectionId) -> Option<Entry> {
        let entry = self.connections.remove(connection_id)?;
        if let Some(set) = self.rooms.get_mut(&entry.record.room_id) {
            set.remove(connection_id);
            if set.is_empty() {
                self.rooms.remove(&entry.record.room_id);
            }
        }
        if let Some(set) = self.users.get_mut(&entry.record.user_id) {
            set.remove(connection_id);
            if set.is_empty() {
                self.users.remove(&entry.record.user_id);
            }
        }
        Some(entry)
    }

    fn records<'a>(&'a self, ids: Option<&'a HashSet<ConnectionId>>) -> Vec<ConnectionRecord> {
        let mut records: Vec<ConnectionRecord> = ids
            .into_iter()
            .flatten()
            .filter_map(|id| self.connections.get(id))
            .map(|entry| entry.record.clone())
            .collect();
        records.sort_by_key(|record| (record.created_at, record.connection_id));
        records
    }
}

/// 在室状態の唯一の管理主体（インメモリ）
pub struct PresenceRegistry {
    indices: Mutex<Indices>,
    clock: Arc<dyn Clock>,
    presence_locks: Box<[AsyncMutex<()>]>,
    stripe_hasher: RandomState,
    removed: Notify,
    shutdown: CancellationToken,
    sweeper: Mutex<Option<JoinHandle<()>>>,
}

impl PresenceRegistry {
    pub fn new(limits: RegistryLimits, clock: Arc<dyn Clock>) -> Self {
        Self {
            indices: Mutex::new(Indices {
                limits,
                ..Indices::default()
            }),
            clock,
            presence_locks: (0..PRESENCE_STRIPES).map(|_| AsyncMutex::new(())).collect(),
            stripe_hasher: RandomState::new(),
            removed: Notify::new(),
            shutdown: CancellationToken::new(),
            sweeper: Mutex::new(None),
        }
    }

    pub fn limits(&self) -> RegistryLimits {
        self.indices.lock().limits
    }

    /// 上限を差し替える。既存の接続は新しい上限を超えていても残す
    pub fn set_limits(&self, limits: RegistryLimits) {
        self.indices.lock().limits = limits;
        tracing::info!(
            per_user = limits.per_user,
            per_room = limits.per_room,
            global = limits.global,
            "connection limits updated"
        );
    }

    /// `user_id` の `room_id` への接続が現時点ですべての上限に収まるか
    pub fn can_admit(&self, user_id: &UserId, room_id: &RoomId) -> bool {
        self.indices.lock().check_capacity(user_id, room_id).is_ok()
    }

    /// 接続を登録する
    ///
    /// 上限チェックと挿入は同じクリティカルセクションで行います。
    /// 同じ (user, room) の接続が既にあれば [`AdmitRejection::Occupied`] を返し、
    /// 呼び出し側に先に退去させます。
    pub fn admit(
        &self,
        user_id: UserId,
        room_id: RoomId,
        connection_id: ConnectionId,
        metadata: ConnectionMetadata,
    ) -> Result<Arc<EvictSignal>, AdmitRejection> {
        if self.shutdown.is_cancelled() {
            return Err(AdmitRejection::ShuttingDown);
        }
        let now = Timestamp::new(self.clock.now_millis());

        let mut indices = self.indices.lock();
        if indices.connections.contains_key(&connection_id) {
            return Err(AdmitRejection::DuplicateId(connection_id));
        }
        if let Some(existing) = indices.find_pair(&user_id, &room_id) {
            return Err(AdmitRejection::Occupied(existing));
        }
        if let Err(kind) = indices.check_capacity(&user_id, &room_id) {
            tracing::warn!(
                user_id = %user_id,
                room_id = %room_id,
                limit = %kind,
                "connection rejected: limit reached"
            );
            return Err(AdmitRejection::Capacity(kind));
        }

        let signal = Arc::new(EvictSignal::new(self.shutdown.child_token()));
        indices.insert(Entry {
            record: ConnectionRecord {
                connection_id,
                user_id: user_id.clone(),
                room_id: room_id.clone(),
                created_at: now,
                last_activity: now,
                metadata,
            },
            signal: signal.clone(),
        });
        let total = indices.connections.len();
        drop(indices);

        tracing::info!(
            connection_id = %connection_id,
            user_id = %user_id,
            room_id = %room_id,
            total,
            "connection admitted"
        );
        Ok(signal)
    }

    /// 登録を外す。未知の id は `None` を返し、何も変えない
    ///
    /// エントリの退去通知は、まだ発火していなければ [`EvictReason::Removed`] で発火します。
    pub fn remove(&self, connection_id: &ConnectionId) -> Option<ConnectionRecord> {
        let entry = self.indices.lock().remove(connection_id)?;
        Some(self.finish_removal(entry))
    }

    /// 登録を外し、同じ (user, room) に別の接続が残っているかを同じクリティカルセクションで判定する
    ///
    /// 戻り値は（外した記録、残っている接続があるか）です。
    /// オフライン通知の要否はこの判定で決め、[`Self::lock_presence`] の内側で配信します。
    pub fn depart(
        &self,
        connection_id: &ConnectionId,
        user_id: &UserId,
        room_id: &RoomId,
    ) -> (Option<ConnectionRecord>, bool) {
        let (entry, pair_held) = {
            let mut indices = self.indices.lock();
            let entry = indices.remove(connection_id);
            (entry, indices.find_pair(user_id, room_id).is_some())
        };
        (entry.map(|entry| self.finish_removal(entry)), pair_held)
    }

    fn finish_removal(&self, entry: Entry) -> ConnectionRecord {
        entry.signal.fire(EvictReason::Removed);
        self.removed.notify_waiters();
        tracing::info!(
            connection_id = %entry.record.connection_id,
            user_id = %entry.record.user_id,
            room_id = %entry.record.room_id,
            "connection removed"
        );
        entry.record
    }

    /// (user, room) ごとの在室通知ロックを取る
    ///
    /// オンライン通知とオフライン通知をこのロックの内側で配信すると、
    /// 同じペアのイベントは判定した順にルームへ届きます。
    pub async fn lock_presence(&self, user_id: &UserId, room_id: &RoomId) -> AsyncMutexGuard<'_, ()> {
        let slot = self.stripe_hasher.hash_one((user_id, room_id)) as usize % self.presence_locks.len();
        self.presence_locks[slot].lock().await
    }

    /// 接続のアクティビティを記録する。未知の id は無視する
    pub fn touch(&self, connection_id: &ConnectionId) {
        let now = Timestamp::new(self.clock.now_millis());
        if let Some(entry) = self.indices.lock().connections.get_mut(connection_id) {
            entry.record.last_activity = now;
        }
    }

    /// 登録は残したまま、`connection_id` の持ち主のセッションに終了を通知する。未知の id なら `false`
    pub fn signal_eviction(&self, connection_id: &ConnectionId, reason: EvictReason) -> bool {
        match self.indices.lock().connections.get(connection_id) {
            Some(entry) => {
                entry.signal.fire(reason);
                true
            }
            None => false,
        }
    }

    /// 最終アクティビティが `stale_before` より古い記録をすべて外して返す
    ///
    /// トランスポートを閉じるのは [`EvictReason::Stale`] を受け取ったセッションの責務です。
    pub fn sweep(&self, stale_before: Timestamp) -> Vec<ConnectionRecord> {
        let evicted: Vec<Entry> = {
            let mut indices = self.indices.lock();
            let stale: Vec<ConnectionId> = indices
                .connections
                .values()
                .filter(|entry| entry.record.last_activity < stale_before)
                .map(|entry| entry.record.connection_id)
                .collect();
            stale
                .iter()
                .filter_map(|id| indices.remove(id))
                .collect()
        };

        if evicted.is_empty() {
            return Vec::new();
        }
        for entry in &evicted {
            entry.signal.fire(EvictReason::Stale);
            tracing::info!(
                connection_id = %entry.record.connection_id,
                user_id = %entry.record.user_id,
                room_id = %entry.record.room_id,
                "stale connection swept"
            );
        }
        self.removed.notify_waiters();
        evicted.into_iter().map(|entry| entry.record).collect()
    }

    pub fn stats(&self) -> RegistryStats {
        let indices = self.indices.lock();
        RegistryStats {
            total_connections: indices.connections.len(),
            room_counts: indices
                .rooms
                .iter()
                .map(|(room, ids)| (room.clone(), ids.len()))
                .collect(),
            user_counts: indices
                .users
                .iter()
                .map(|(user, ids)| (user.clone(), ids.len()))
                .collect(),
        }
    }

    /// ルームにいるユーザー（呼び出しごとに計算）
    pub fn room_presence(&self, room_id: &RoomId) -> BTreeSet<UserId> {
        let indices = self.indices.lock();
        indices
            .rooms
            .get(room_id)
            .into_iter()
            .flatten()
            .filter_map(|id| indices.connections.get(id))
            .map(|entry| entry.record.user_id.clone())
            .collect()
    }

    pub fn contains(&self, connection_id: &ConnectionId) -> bool {
        self.indices.lock().connections.contains_key(connection_id)
    }

    pub fn connection(&self, connection_id: &ConnectionId) -> Option<ConnectionRecord> {
        self.indices
            .lock()
            .connections
            .get(connection_id)
            .map(|entry| entry.record.clone())
    }

    pub fn room_connections(&self, room_id: &RoomId) -> Vec<ConnectionRecord> {
        let indices = self.indices.lock();
        indices.records(indices.rooms.get(room_id))
    }

    pub fn user_connections(&self, user_id: &UserId) -> Vec<ConnectionRecord> {
        let indices = self.indices.lock();
        indices.records(indices.users.get(user_id))
    }

    /// (user, room) を保持している接続
    pub fn find_pair(&self, user_id: &UserId, room_id: &RoomId) -> Option<ConnectionId> {
        self.indices.lock().find_pair(user_id, room_id)
    }

    pub fn is_user_in_room(&self, user_id: &UserId, room_id: &RoomId) -> bool {
        self.find_pair(user_id, room_id).is_some()
    }

    /// `connection_id` の登録が消えるまで最大 `timeout` 待つ。消えたことを観測できたか返す
    pub async fn wait_for_removal(&self, connection_id: &ConnectionId, timeout: Duration) -> bool {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            let notified = self.removed.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if !self.contains(connection_id) {
                return true;
            }
            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                return !self.contains(connection_id);
            }
        }
    }

    /// 定期的な stale sweep を起動する。再度呼ぶと前のものを置き換える
    pub fn start_sweeper(self: &Arc<Self>, interval: Duration, stale_after: Duration) {
        let registry = Arc::clone(self);
        let shutdown = self.shutdown.clone();
        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval_at(tokio::time::Instant::now() + interval, interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = ticker.tick() => {}
                }
                let threshold = i64::try_from(stale_after.as_millis()).unwrap_or(i64::MAX);
                let stale_before =
                    Timestamp::new(registry.clock.now_millis().saturating_sub(threshold));
                let evicted = registry.sweep(stale_before);
                if !evicted.is_empty() {
                    tracing::info!(count = evicted.len(), "stale sweep finished");
                }
            }
            tracing::debug!("presence sweeper stopped");
        });

        if let Some(previous) = self.sweeper.lock().replace(handle) {
            previous.abort();
        }
    }

    pub fn is_shut_down(&self) -> bool {
        self.shutdown.is_cancelled()
    }

    /// 掃除を止め、全セッションに終了を通知してインデックスを空にする
    ///
    /// 以降の登録は拒否されます。通知した接続数を返します。
    pub fn shutdown(&self) -> usize {
        self.shutdown.cancel();
        if let Some(handle) = self.sweeper.lock().take() {
            handle.abort();
        }

        let entries: Vec<Entry> = {
            let mut indices = self.indices.lock();
            indices.rooms.clear();
            indices.users.clear();
            indices.connections.drain().map(|(_, entry)| entry).collect()
        };
        for entry in &entries {
            entry.signal.fire(EvictReason::Shutdown);
        }
        self.removed.notify_waiters();

        tracing::info!(connections = entries.len(), "presence registry shut down");
        entries.len()
    }

    #[cfg(test)]
    fn assert_consistent(&self) {
        let indices = self.indices.lock();
        let forward: HashSet<ConnectionId> = indices.connections.keys().copied().collect();
        let via_rooms: HashSet<ConnectionId> = indices.rooms.values().flatten().copied().collect();
        let via_users: HashSet<ConnectionId> = indices.users.values().flatten().copied().collect();
        assert_eq!(forward, via_rooms);
        assert_eq!(forward, via_users);
        assert!(indices.rooms.values().all(|set| !set.is_empty()));
        assert!(indices.users.values().all(|set| !set.is_empty()));
        for entry in indices.connections.values() {
            let id = entry.record.connection_id;
            assert!(indices.rooms[&entry.record.room_id].contains(&id));
            assert!(indices.users[&entry.record.user_id].contains(&id));
        }
    }
}

#[cfg(test)]
mod tests {
    use irori_shared::time::{FixedClock, ManualClock};

    use super::*;

    fn user(id: &str) -> UserId {
        UserId::new(id.to_string()).unwrap()
    }

    fn room(id: &str) -> RoomId {
        RoomId::new(id.to_string()).unwrap()
    }

    fn create_registry(limits: RegistryLimits) -> PresenceRegistry {
        PresenceRegistry::new(limits, Arc::new(FixedClock::new(1_000)))
    }

    fn admit(
        registry: &PresenceRegistry,
        user_id: &str,
        room_id: &str,
    ) -> Result<(ConnectionId, Arc<EvictSignal>), AdmitRejection> {
        let connection_id = ConnectionId::generate();
        registry
            .admit(
                user(user_id),
                room(room_id),
                connection_id,
                ConnectionMetadata::default(),
            )
            .map(|signal| (connection_id, signal))
    }

    #[test]
    fn test_admit_registers_in_every_index() {
        // テスト項目: admit で正引きマップと 2 つの逆引きインデックスに登録される
        // given (前提条件):
        let registry = create_registry(RegistryLimits::default());

        // when (操作):
        let (id, _signal) = admit(&registry, "alice", "lobby").unwrap();

        // then (期待する結果):
        assert!(registry.contains(&id));
        assert_eq!(registry.room_connections(&room("lobby")).len(), 1);
        assert_eq!(registry.user_connections(&user("alice")).len(), 1);
        assert_eq!(registry.find_pair(&user("alice"), &room("lobby")), Some(id));
        let record = registry.connection(&id).unwrap();
        assert_eq!(record.created_at, Timestamp::new(1_000));
        registry.assert_consistent();
    }

    #[test]
    fn test_room_limit_is_enforced() {
        // テスト項目: ルーム単位の上限を超える接続は拒否される
        // given (前提条件):
        let registry = create_registry(RegistryLimits {
            per_user: 5,
            per_room: 2,
            global: 100,
        });
        admit(&registry, "alice", "lobby").unwrap();
        admit(&registry, "bob", "lobby").unwrap();

        // when (操作):
        let result = admit(&registry, "carol", "lobby");

        // then (期待する結果):
        assert_eq!(result.err(), Some(AdmitRejection::Capacity(CapacityKind::Room)));
        assert!(!registry.can_admit(&user("carol"), &room("lobby")));
        assert!(registry.can_admit(&user("carol"), &room("garden")));
        assert_eq!(registry.stats().total_connections, 2);
    }

    #[test]
    fn test_user_and_global_limits_are_enforced() {
        // テスト項目: ユーザー単位と全体の上限が守られる
        // given (前提条件):
        let registry = create_registry(RegistryLimits {
            per_user: 2,
            per_room: 100,
            global: 3,
        });
        admit(&registry, "alice", "r1").unwrap();
        admit(&registry, "alice", "r2").unwrap();

        // when (操作):
        let third_for_alice = admit(&registry, "alice", "r3");
        admit(&registry, "bob", "r1").unwrap();
        let fourth_overall = admit(&registry, "carol", "r1");

        // then (期待する結果):
        assert_eq!(
            third_for_alice.err(),
            Some(AdmitRejection::Capacity(CapacityKind::User))
        );
        assert_eq!(
            fourth_overall.err(),
            Some(AdmitRejection::Capacity(CapacityKind::Global))
        );
        registry.assert_consistent();
    }

    #[test]
    fn test_same_pair_is_reported_as_occupied() {
        // テスト項目: 同じ (user, room) の 2 本目は Occupied として報告される
        // given (前提条件):
        let registry = create_registry(RegistryLimits::default());
        let (first, _signal) = admit(&registry, "alice", "lobby").unwrap();

        // when (操作):
        let result = admit(&registry, "alice", "lobby");

        // then (期待する結果):
        assert_eq!(result.err(), Some(AdmitRejection::Occupied(first)));
        assert_eq!(registry.user_connections(&user("alice")).len(), 1);
    }

    #[test]
    fn test_same_user_in_different_rooms_is_admitted() {
        // テスト項目: 同じユーザーが別ルームに接続するのは許可され、同ルームの再接続は既存を指す
        // given (前提条件):
        let registry = create_registry(RegistryLimits::default());
        let (in_lobby, _s1) = admit(&registry, "u1", "lobby").unwrap();
        let (in_garden, _s2) = admit(&registry, "u1", "garden").unwrap();

        // when (操作):
        let third = admit(&registry, "u1", "lobby");

        // then (期待する結果):
        assert_ne!(in_lobby, in_garden);
        assert_eq!(third.err(), Some(AdmitRejection::Occupied(in_lobby)));
    }

    #[test]
    fn test_remove_is_idempotent() {
        // テスト項目: 同じ connection_id を 2 回 remove しても安全で、2 回目は何もしない
        // given (前提条件):
        let registry = create_registry(RegistryLimits::default());
        let (id, signal) = admit(&registry, "alice", "lobby").unwrap();
        admit(&registry, "bob", "lobby").unwrap();

        // when (操作):
        let first = registry.remove(&id);
        let stats_after_first = registry.stats();
        let second = registry.remove(&id);

        // then (期待する結果):
        assert!(first.is_some());
        assert!(second.is_none());
        assert_eq!(registry.stats(), stats_after_first);
        assert!(signal.is_fired());
        assert_eq!(signal.reason(), EvictReason::Removed);
        registry.assert_consistent();
    }

    #[test]
    fn test_remove_prunes_empty_index_entries() {
        // テスト項目: 最後の接続が外れたルーム・ユーザーのキーは削除される
        // given (前提条件):
        let registry = create_registry(RegistryLimits::default());
        let (id, _signal) = admit(&registry, "alice", "lobby").unwrap();

        // when (操作):
        registry.remove(&id);

        // then (期待する結果):
        let stats = registry.stats();
        assert_eq!(stats.total_connections, 0);
        assert!(stats.room_counts.is_empty());
        assert!(stats.user_counts.is_empty());
    }

    #[test]
    fn test_indices_stay_consistent_over_mixed_operations() {
        // テスト項目: admit/remove を混ぜた任意の操作列の後もインデックスが整合する
        // given (前提条件):
        let registry = create_registry(RegistryLimits {
            per_user: 3,
            per_room: 4,
            global: 10,
        });
        let users = ["u1", "u2", "u3", "u4"];
        let rooms = ["r1", "r2", "r3"];
        let mut admitted = Vec::new();

        // when (操作):
        for step in 0..200usize {
            if step % 3 == 2 && !admitted.is_empty() {
                let index = (step * 7) % admitted.len();
                let id: ConnectionId = admitted.remove(index);
                registry.remove(&id);
            } else if let Ok((id, _)) = admit(
                &registry,
                users[(step * 5) % users.len()],
                rooms[(step * 11) % rooms.len()],
            ) {
                admitted.push(id);
            }

            // then (期待する結果):
            registry.assert_consistent();
            let stats = registry.stats();
            assert!(stats.total_connections <= 10);
            assert!(stats.room_counts.values().all(|count| *count <= 4));
            assert!(stats.user_counts.values().all(|count| *count <= 3));
        }
    }

    #[test]
    fn test_sweep_evicts_only_stale_connections() {
        // テスト項目: 最終アクティビティが閾値より古い接続だけが掃除される
        // given (前提条件):
        let clock = Arc::new(ManualClock::new(0));
        let registry = PresenceRegistry::new(RegistryLimits::default(), clock.clone());
        let (quiet, quiet_signal) = admit(&registry, "alice", "lobby").unwrap();
        let (busy, busy_signal) = admit(&registry, "bob", "lobby").unwrap();
        clock.advance(10_000);
        registry.touch(&busy);

        // when (操作):
        let evicted = registry.sweep(Timestamp::new(5_000));

        // then (期待する結果):
        assert_eq!(evicted.len(), 1);
        assert_eq!(evicted[0].connection_id, quiet);
        assert!(!registry.contains(&quiet));
        assert!(registry.contains(&busy));
        assert_eq!(quiet_signal.reason(), EvictReason::Stale);
        assert!(!busy_signal.is_fired());
        registry.assert_consistent();
    }

    #[test]
    fn test_room_presence_lists_unique_users() {
        // テスト項目: ルームのオンラインユーザーは接続から都度計算される
        // given (前提条件):
        let registry = create_registry(RegistryLimits::default());
        admit(&registry, "bob", "lobby").unwrap();
        admit(&registry, "alice", "lobby").unwrap();
        admit(&registry, "carol", "garden").unwrap();

        // when (操作):
        let presence = registry.room_presence(&room("lobby"));

        // then (期待する結果):
        let expected: BTreeSet<UserId> = [user("alice"), user("bob")].into_iter().collect();
        assert_eq!(presence, expected);
        assert!(registry.room_presence(&room("empty")).is_empty());
    }

    #[test]
    fn test_set_limits_applies_to_later_admissions() {
        // テスト項目: set_limits 後の admit に新しい上限が適用される
        // given (前提条件):
        let registry = create_registry(RegistryLimits::default());
        admit(&registry, "alice", "lobby").unwrap();

        // when (操作):
        registry.set_limits(RegistryLimits {
            per_user: 5,
            per_room: 1,
            global: 1000,
        });

        // then (期待する結果):
        assert_eq!(
            admit(&registry, "bob", "lobby").err(),
            Some(AdmitRejection::Capacity(CapacityKind::Room))
        );
        assert_eq!(registry.limits().per_room, 1);
    }

    #[test]
    fn test_signal_eviction_keeps_record() {
        // テスト項目: signal_eviction は記録を残したまま退去を通知する
        // given (前提条件):
        let registry = create_registry(RegistryLimits::default());
        let (id, signal) = admit(&registry, "alice", "lobby").unwrap();

        // when (操作):
        let signalled = registry.signal_eviction(&id, EvictReason::Replaced);

        // then (期待する結果):
        assert!(signalled);
        assert!(registry.contains(&id));
        assert_eq!(signal.reason(), EvictReason::Replaced);
        assert!(!registry.signal_eviction(&ConnectionId::generate(), EvictReason::Replaced));
    }

    #[tokio::test]
    async fn test_wait_for_removal_observes_concurrent_remove() {
        // テスト項目: 別タスクでの remove を wait_for_removal が観測する
        // given (前提条件):
        let registry = Arc::new(create_registry(RegistryLimits::default()));
        let (id, signal) = admit(&registry, "alice", "lobby").unwrap();
        let owner = registry.clone();
        tokio::spawn(async move {
            signal.fired().await;
            owner.remove(&id);
        });

        // when (操作):
        registry.signal_eviction(&id, EvictReason::Replaced);
        let removed = registry.wait_for_removal(&id, Duration::from_secs(2)).await;

        // then (期待する結果):
        assert!(removed);
        assert!(!registry.contains(&id));
    }

    #[tokio::test(start_paused = true)]
    async fn test_wait_for_removal_gives_up_after_ceiling() {
        // テスト項目: 削除されない接続の待機は上限時間で打ち切られる
        // given (前提条件):
        let registry = create_registry(RegistryLimits::default());
        let (id, _signal) = admit(&registry, "alice", "lobby").unwrap();

        // when (操作):
        let started = tokio::time::Instant::now();
        let removed = registry.wait_for_removal(&id, Duration::from_secs(2)).await;

        // then (期待する結果):
        assert!(!removed);
        assert!(started.elapsed() >= Duration::from_secs(2));
        assert!(registry.contains(&id));
    }

    #[tokio::test(start_paused = true)]
    async fn test_sweeper_runs_periodically() {
        // テスト項目: start_sweeper が一定間隔で古い接続を掃除する
        // given (前提条件):
        let clock = Arc::new(ManualClock::new(0));
        let registry = Arc::new(PresenceRegistry::new(
            RegistryLimits::default(),
            clock.clone(),
        ));
        let (id, signal) = admit(&registry, "alice", "lobby").unwrap();
        registry.start_sweeper(Duration::from_secs(300), Duration::from_secs(300));

        // when (操作):
        clock.advance(301_000);
        tokio::time::sleep(Duration::from_secs(301)).await;

        // then (期待する結果):
        assert!(!registry.contains(&id));
        assert_eq!(signal.reason(), EvictReason::Stale);
        registry.shutdown();
    }

    #[tokio::test]
    async fn test_shutdown_signals_sessions_and_rejects_admission() {
        // テスト項目: shutdown で全セッションに退去が通知され、以降の admit は拒否される
        // given (前提条件):
        let registry = Arc::new(create_registry(RegistryLimits::default()));
        let (_a, signal_a) = admit(&registry, "alice", "lobby").unwrap();
        let (_b, signal_b) = admit(&registry, "bob", "garden").unwrap();
        registry.start_sweeper(Duration::from_secs(300), Duration::from_secs(300));

        // when (操作):
        let signalled = registry.shutdown();

        // then (期待する結果):
        assert_eq!(signalled, 2);
        assert_eq!(signal_a.reason(), EvictReason::Shutdown);
        assert_eq!(signal_b.reason(), EvictReason::Shutdown);
        assert_eq!(registry.stats().total_connections, 0);
        assert_eq!(
            admit(&registry, "carol", "lobby").err(),
            Some(AdmitRejection::ShuttingDown)
        );
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_admissions_never_exceed_room_limit() {
        // テスト項目: 並行した admit でもルーム上限を超えない
        // given (前提条件):
        let registry = Arc::new(create_registry(RegistryLimits {
            per_user: 5,
            per_room: 10,
            global: 1000,
        }));

        // when (操作):
        let mut handles = Vec::new();
        for n in 0..50 {
            let registry = registry.clone();
            handles.push(tokio::spawn(async move {
                admit(&registry, &format!("user{n}"), "lobby").is_ok()
            }));
        }
        let mut admitted = 0;
        for handle in handles {
            if handle.await.unwrap() {
                admitted += 1;
            }
        }

        // then (期待する結果):
        assert_eq!(admitted, 10);
        assert_eq!(registry.room_connections(&room("lobby")).len(), 10);
        registry.assert_consistent();
    }

    #[test]
    fn test_depart_reports_whether_pair_is_still_held() {
        // テスト項目: depart は削除と同時に同じ (user, room) の接続が残っているかを返す
        // given (前提条件): 強制削除の後に新しい接続が登録された状況
        let registry = create_registry(RegistryLimits::default());
        let (old, _old_signal) = admit(&registry, "alice", "lobby").unwrap();
        let (other_room, _s) = admit(&registry, "alice", "garden").unwrap();

        // when (操作):
        let (removed_room, held_after_room) =
            registry.depart(&other_room, &user("alice"), &room("garden"));
        registry.remove(&old);
        let (new, _new_signal) = admit(&registry, "alice", "lobby").unwrap();
        let (removed_old, held_after_old) = registry.depart(&old, &user("alice"), &room("lobby"));

        // then (期待する結果):
        assert!(removed_room.is_some());
        assert!(!held_after_room);
        assert!(removed_old.is_none());
        assert!(held_after_old);
        assert!(registry.contains(&new));
        registry.assert_consistent();
    }

    #[tokio::test]
    async fn test_lock_presence_serializes_same_pair() {
        // テスト項目: 同じ (user, room) の在室ロックは前の保持者が手放すまで取れない
        // given (前提条件):
        let registry = Arc::new(create_registry(RegistryLimits::default()));
        let guard = registry.lock_presence(&user("alice"), &room("lobby")).await;
        let contender = registry.clone();
        let waiting = tokio::spawn(async move {
            let _turn = contender.lock_presence(&user("alice"), &room("lobby")).await;
        });

        // when (操作):
        tokio::time::sleep(Duration::from_millis(50)).await;
        let finished_while_held = waiting.is_finished();
        drop(guard);

        // then (期待する結果):
        assert!(!finished_while_held);
        tokio::time::timeout(Duration::from_secs(1), waiting)
            .await
            .unwrap()
            .unwrap();
    }
}
