//! 锁记录模型
//!
//! `cluster_lock` 表中的一行对应一把具名锁的当前持有状态。
//! 行不存在即表示未加锁；干净解锁时删除该行。

/// 锁记录
///
/// 只是跨存储边界传递的数据，不承载任何加锁行为。
#[derive(Debug, Clone, PartialEq, Eq, sqlx::FromRow)]
pub struct LockRecord {
    /// 锁名，主键，创建后不可变
    pub name: String,
    pub locked: bool,
    /// 过期时间（epoch 毫秒），过期后其他节点可以抢占
    pub expiration: i64,
    /// 持有者节点标识
    pub owner: Option<String>,
}

impl LockRecord {
    /// 构造一条被 `owner` 持有、在 `expiration` 过期的记录
    pub fn held_by(name: &str, owner: &str, expiration: i64) -> Self {
        Self {
            name: name.to_string(),
            locked: true,
            expiration,
            owner: Some(owner.to_string()),
        }
    }

    /// 在 `now` 时刻是否仍被有效持有
    pub fn is_held_at(&self, now: i64) -> bool {
        self.locked && self.expiration > now
    }

    pub fn is_owned_by(&self, self_identifier: &str) -> bool {
        self.owner.as_deref() == Some(self_identifier)
    }
}

/// 插入锁记录的结果
///
/// 主键冲突说明另一个节点抢先创建了该行，属于正常竞争而不是故障。
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InsertOutcome {
    Inserted,
    AlreadyExists,
}
