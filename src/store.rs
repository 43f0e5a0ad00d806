//! Key-value store adapter
//!
//! Typed operations over the Redis data structures the gateway relies on:
//! hashes, sets, sorted sets, strings with TTLs, atomic RENAME and SCAN.
//! All cross-task coordination goes through this adapter; no other module
//! talks to the store directly.

use std::collections::HashMap;

use redis::aio::MultiplexedConnection;

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("store connection error: {0}")]
    Connection(String),
    #[error("store command error: {0}")]
    Command(String),
}

pub type StoreResult<T> = Result<T, StoreError>;

fn cmd_err(e: redis::RedisError) -> StoreError {
    StoreError::Command(e.to_string())
}

#[derive(Clone)]
pub struct Store {
    conn: MultiplexedConnection,
}

impl Store {
    pub async fn connect(redis_url: &str) -> StoreResult<Self> {
        let client =
            redis::Client::open(redis_url).map_err(|e| StoreError::Connection(e.to_string()))?;
        let conn = client
            .get_multiplexed_async_connection()
            .await
            .map_err(|e| StoreError::Connection(e.to_string()))?;
        let store = Self { conn };
        store.ping().await?;
        crate::logger::info("store", "Key-value store connection established");
        Ok(store)
    }

    pub async fn ping(&self) -> StoreResult<()> {
        let mut conn = self.conn.clone();
        let pong: String = redis::cmd("PING")
            .query_async(&mut conn)
            .await
            .map_err(cmd_err)?;
        if pong != "PONG" {
            return Err(StoreError::Command(format!(
                "Unexpected PING response: {}",
                pong
            )));
        }
        Ok(())
    }

    // ------------------------------------------------------------------
    // Strings
    // ------------------------------------------------------------------

    pub async fn get(&self, key: &str) -> StoreResult<Option<String>> {
        let mut conn = self.conn.clone();
        redis::cmd("GET")
            .arg(key)
            .query_async(&mut conn)
            .await
            .map_err(cmd_err)
    }

    pub async fn set(&self, key: &str, value: &str) -> StoreResult<()> {
        let mut conn = self.conn.clone();
        redis::cmd("SET")
            .arg(key)
            .arg(value)
            .query_async(&mut conn)
            .await
            .map_err(cmd_err)
    }

    pub async fn set_ex(&self, key: &str, value: &str, ttl_secs: u64) -> StoreResult<()> {
        let mut conn = self.conn.clone();
        redis::cmd("SET")
            .arg(key)
            .arg(value)
            .arg("EX")
            .arg(ttl_secs)
            .query_async(&mut conn)
            .await
            .map_err(cmd_err)
    }

    /// SET NX EX; returns true when the lock/key was acquired.
    pub async fn set_nx_ex(&self, key: &str, value: &str, ttl_secs: u64) -> StoreResult<bool> {
        let mut conn = self.conn.clone();
        let reply: Option<String> = redis::cmd("SET")
            .arg(key)
            .arg(value)
            .arg("NX")
            .arg("EX")
            .arg(ttl_secs)
            .query_async(&mut conn)
            .await
            .map_err(cmd_err)?;
        Ok(reply.is_some())
    }

    pub async fn del(&self, key: &str) -> StoreResult<()> {
        let mut conn = self.conn.clone();
        redis::cmd("DEL")
            .arg(key)
            .query_async(&mut conn)
            .await
            .map_err(cmd_err)
    }

    pub async fn exists(&self, key: &str) -> StoreResult<bool> {
        let mut conn = self.conn.clone();
        let n: i64 = redis::cmd("EXISTS")
            .arg(key)
            .query_async(&mut conn)
            .await
            .map_err(cmd_err)?;
        Ok(n > 0)
    }

    pub async fn expire(&self, key: &str, ttl_secs: u64) -> StoreResult<()> {
        let mut conn = self.conn.clone();
        let _: i64 = redis::cmd("EXPIRE")
            .arg(key)
            .arg(ttl_secs)
            .query_async(&mut conn)
            .await
            .map_err(cmd_err)?;
        Ok(())
    }

    /// Atomic swap used by the cost-rank refresh.
    pub async fn rename(&self, src: &str, dst: &str) -> StoreResult<()> {
        let mut conn = self.conn.clone();
        redis::cmd("RENAME")
            .arg(src)
            .arg(dst)
            .query_async(&mut conn)
            .await
            .map_err(cmd_err)
    }

    pub async fn incr_by(&self, key: &str, delta: i64) -> StoreResult<i64> {
        let mut conn = self.conn.clone();
        redis::cmd("INCRBY")
            .arg(key)
            .arg(delta)
            .query_async(&mut conn)
            .await
            .map_err(cmd_err)
    }

    pub async fn incr_by_float(&self, key: &str, delta: f64) -> StoreResult<f64> {
        let mut conn = self.conn.clone();
        redis::cmd("INCRBYFLOAT")
            .arg(key)
            .arg(delta)
            .query_async(&mut conn)
            .await
            .map_err(cmd_err)
    }

    pub async fn decr(&self, key: &str) -> StoreResult<i64> {
        let mut conn = self.conn.clone();
        redis::cmd("DECR")
            .arg(key)
            .query_async(&mut conn)
            .await
            .map_err(cmd_err)
    }

    pub async fn mget(&self, keys: &[String]) -> StoreResult<Vec<Option<String>>> {
        if keys.is_empty() {
            return Ok(Vec::new());
        }
        let mut conn = self.conn.clone();
        let mut cmd = redis::cmd("MGET");
        for key in keys {
            cmd.arg(key);
        }
        cmd.query_async(&mut conn).await.map_err(cmd_err)
    }

    // ------------------------------------------------------------------
    // Hashes
    // ------------------------------------------------------------------

    pub async fn hget_all(&self, key: &str) -> StoreResult<HashMap<String, String>> {
        let mut conn = self.conn.clone();
        redis::cmd("HGETALL")
            .arg(key)
            .query_async(&mut conn)
            .await
            .map_err(cmd_err)
    }

    pub async fn hget(&self, key: &str, field: &str) -> StoreResult<Option<String>> {
        let mut conn = self.conn.clone();
        redis::cmd("HGET")
            .arg(key)
            .arg(field)
            .query_async(&mut conn)
            .await
            .map_err(cmd_err)
    }

    pub async fn hset(&self, key: &str, field: &str, value: &str) -> StoreResult<()> {
        let mut conn = self.conn.clone();
        let _: i64 = redis::cmd("HSET")
            .arg(key)
            .arg(field)
            .arg(value)
            .query_async(&mut conn)
            .await
            .map_err(cmd_err)?;
        Ok(())
    }

    pub async fn hset_map(&self, key: &str, fields: &[(String, String)]) -> StoreResult<()> {
        if fields.is_empty() {
            return Ok(());
        }
        let mut conn = self.conn.clone();
        let mut cmd = redis::cmd("HSET");
        cmd.arg(key);
        for (field, value) in fields {
            cmd.arg(field).arg(value);
        }
        let _: i64 = cmd.query_async(&mut conn).await.map_err(cmd_err)?;
        Ok(())
    }

    pub async fn hdel(&self, key: &str, fields: &[&str]) -> StoreResult<()> {
        if fields.is_empty() {
            return Ok(());
        }
        let mut conn = self.conn.clone();
        let mut cmd = redis::cmd("HDEL");
        cmd.arg(key);
        for field in fields {
            cmd.arg(*field);
        }
        let _: i64 = cmd.query_async(&mut conn).await.map_err(cmd_err)?;
        Ok(())
    }

    pub async fn hincr_by(&self, key: &str, field: &str, delta: i64) -> StoreResult<i64> {
        let mut conn = self.conn.clone();
        redis::cmd("HINCRBY")
            .arg(key)
            .arg(field)
            .arg(delta)
            .query_async(&mut conn)
            .await
            .map_err(cmd_err)
    }

    pub async fn hincr_by_float(&self, key: &str, field: &str, delta: f64) -> StoreResult<f64> {
        let mut conn = self.conn.clone();
        redis::cmd("HINCRBYFLOAT")
            .arg(key)
            .arg(field)
            .arg(delta)
            .query_async(&mut conn)
            .await
            .map_err(cmd_err)
    }

    // ------------------------------------------------------------------
    // Sets
    // ------------------------------------------------------------------

    pub async fn sadd(&self, key: &str, member: &str) -> StoreResult<()> {
        let mut conn = self.conn.clone();
        let _: i64 = redis::cmd("SADD")
            .arg(key)
            .arg(member)
            .query_async(&mut conn)
            .await
            .map_err(cmd_err)?;
        Ok(())
    }

    pub async fn srem(&self, key: &str, member: &str) -> StoreResult<()> {
        let mut conn = self.conn.clone();
        let _: i64 = redis::cmd("SREM")
            .arg(key)
            .arg(member)
            .query_async(&mut conn)
            .await
            .map_err(cmd_err)?;
        Ok(())
    }

    pub async fn smembers(&self, key: &str) -> StoreResult<Vec<String>> {
        let mut conn = self.conn.clone();
        redis::cmd("SMEMBERS")
            .arg(key)
            .query_async(&mut conn)
            .await
            .map_err(cmd_err)
    }

    pub async fn sismember(&self, key: &str, member: &str) -> StoreResult<bool> {
        let mut conn = self.conn.clone();
        let n: i64 = redis::cmd("SISMEMBER")
            .arg(key)
            .arg(member)
            .query_async(&mut conn)
            .await
            .map_err(cmd_err)?;
        Ok(n > 0)
    }

    // ------------------------------------------------------------------
    // Sorted sets
    // ------------------------------------------------------------------

    pub async fn zadd(&self, key: &str, score: f64, member: &str) -> StoreResult<()> {
        let mut conn = self.conn.clone();
        let _: i64 = redis::cmd("ZADD")
            .arg(key)
            .arg(score)
            .arg(member)
            .query_async(&mut conn)
            .await
            .map_err(cmd_err)?;
        Ok(())
    }

    pub async fn zadd_multi(&self, key: &str, entries: &[(f64, String)]) -> StoreResult<()> {
        if entries.is_empty() {
            return Ok(());
        }
        let mut conn = self.conn.clone();
        let mut cmd = redis::cmd("ZADD");
        cmd.arg(key);
        for (score, member) in entries {
            cmd.arg(*score).arg(member);
        }
        let _: i64 = cmd.query_async(&mut conn).await.map_err(cmd_err)?;
        Ok(())
    }

    pub async fn zrem(&self, key: &str, member: &str) -> StoreResult<()> {
        let mut conn = self.conn.clone();
        let _: i64 = redis::cmd("ZREM")
            .arg(key)
            .arg(member)
            .query_async(&mut conn)
            .await
            .map_err(cmd_err)?;
        Ok(())
    }

    pub async fn zcard(&self, key: &str) -> StoreResult<i64> {
        let mut conn = self.conn.clone();
        redis::cmd("ZCARD")
            .arg(key)
            .query_async(&mut conn)
            .await
            .map_err(cmd_err)
    }

    /// ZREVRANGE with scores; highest first.
    pub async fn zrevrange_with_scores(
        &self,
        key: &str,
        start: i64,
        stop: i64,
    ) -> StoreResult<Vec<(String, f64)>> {
        let mut conn = self.conn.clone();
        redis::cmd("ZREVRANGE")
            .arg(key)
            .arg(start)
            .arg(stop)
            .arg("WITHSCORES")
            .query_async(&mut conn)
            .await
            .map_err(cmd_err)
    }

    // ------------------------------------------------------------------
    // Scan
    // ------------------------------------------------------------------

    /// Full keyspace scan for a pattern. Cursor loop, never KEYS.
    pub async fn scan_match(&self, pattern: &str) -> StoreResult<Vec<String>> {
        let mut conn = self.conn.clone();
        let mut cursor: u64 = 0;
        let mut keys = Vec::new();
        loop {
            let (next, batch): (u64, Vec<String>) = redis::cmd("SCAN")
                .arg(cursor)
                .arg("MATCH")
                .arg(pattern)
                .arg("COUNT")
                .arg(200)
                .query_async(&mut conn)
                .await
                .map_err(cmd_err)?;
            keys.extend(batch);
            cursor = next;
            if cursor == 0 {
                break;
            }
        }
        Ok(keys)
    }
}
