use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use crossbeam::queue::ArrayQueue;
use redis::aio::Connection;
use redis::{Client, ErrorKind, RedisError};
use tracing::warn;

use crate::SharedStore;

const DEL_IF_VALUE: &str = r#"
    if redis.call("get",KEYS[1]) == ARGV[1] then
       redis.call("del",KEYS[1])
       return 1
    else
       return 0
    end
    "#;

const HSWAP: &str = r#"
    local old = redis.call("HGET", KEYS[1], ARGV[1])
    redis.call("HSET", KEYS[1], ARGV[1], ARGV[2])
    return old
    "#;

async fn get_connection(client: &Client, ms: u64) -> Result<Connection> {
    tokio::select! {
        _ = tokio::time::sleep(Duration::from_millis(ms)) => {
            Err(anyhow!("connection timeout"))
        }
        result = client.get_async_connection() => {
            let connection = result?;
            Ok(connection)
        }
    }
}

struct Node {
    conns: ArrayQueue<Connection>,
    client: Client,
}

/// Pooled connections to a single redis node. Connections that saw an io
/// error are dropped instead of being returned to the pool.
#[derive(Clone)]
pub struct RedisPool {
    node: Arc<Node>,
}

struct PooledConnection {
    conn: Option<Connection>,
    in_query: bool,
    had_error: bool,
    node: Arc<Node>,
}

impl Drop for PooledConnection {
    fn drop(&mut self) {
        if self.in_query || self.had_error {
            // the query was cancelled half way or the connection is broken,
            // don't put it back to the pool
            return;
        }
        if let Some(conn) = self.conn.take() {
            let _ = self.node.conns.push(conn);
        }
    }
}

impl RedisPool {
    pub fn open(addr: &str) -> Result<RedisPool> {
        let client = Client::open(addr)?;
        let pool = RedisPool {
            node: Arc::new(Node {
                conns: ArrayQueue::new(100),
                client,
            }),
        };
        let local_pool = pool.clone();
        tokio::spawn(async move {
            local_pool.monitor().await;
        });
        Ok(pool)
    }

    async fn monitor(&self) {
        let mut active = true;
        let mut interval = tokio::time::interval(Duration::from_secs(1));
        loop {
            interval.tick().await;
            let mut n = 0;
            let now_active = loop {
                if check_node(&self.node.client).await.unwrap_or(false) {
                    break true;
                }
                n += 1;
                if n > 3 {
                    break false;
                }
            };
            if now_active != active {
                active = now_active;
                warn!("redis node active changed to {active}");
            }
        }
    }

    async fn get_conn(&self) -> Result<PooledConnection> {
        let conn = match self.node.conns.pop() {
            Some(conn) => conn,
            None => get_connection(&self.node.client, 1000).await?,
        };
        Ok(PooledConnection {
            conn: Some(conn),
            in_query: false,
            had_error: false,
            node: self.node.clone(),
        })
    }

    pub async fn query<T: redis::FromRedisValue>(
        &self,
        cmd: &str,
        args: &[&str],
    ) -> Result<T> {
        let mut n = 0;
        let mut m = 0;
        loop {
            if let Ok(mut conn) = self.get_conn().await {
                conn.in_query = true;
                let result: Result<T, RedisError> = match conn.conn.as_mut() {
                    Some(c) => redis::cmd(cmd).arg(args).query_async(c).await,
                    None => return Err(anyhow!("pooled connection is empty")),
                };
                conn.in_query = false;

                match result {
                    Err(e)
                        if e.is_io_error()
                            || e.kind() == ErrorKind::BusyLoadingError =>
                    {
                        conn.had_error = true;
                    }
                    result => return result.map_err(|e| anyhow!(e)),
                }
            }

            if m > 100 {
                return Err(anyhow!("redis retried more than 100 times, quit"));
            }
            if n > 10 {
                tokio::time::sleep(Duration::from_millis(100)).await;
                n = 0;
            }

            m += 1;
            n += 1;
        }
    }

    async fn eval<T: redis::FromRedisValue>(
        &self,
        script: &str,
        key: &str,
        args: &[&str],
    ) -> Result<T> {
        let mut params = vec![script, "1", key];
        params.extend_from_slice(args);
        self.query("EVAL", &params).await
    }
}

#[async_trait]
impl SharedStore for RedisPool {
    async fn get(&self, key: &str) -> Result<Option<String>> {
        self.query("GET", &[key]).await
    }

    async fn set_ex(&self, key: &str, value: &str, expire: u64) -> Result<()> {
        let _: String = self
            .query("SETEX", &[key, &expire.to_string(), value])
            .await?;
        Ok(())
    }

    async fn set_nx_ex(&self, key: &str, value: &str, expire: u64) -> Result<bool> {
        let result: Option<String> = self
            .query("SET", &[key, value, "EX", &expire.to_string(), "NX"])
            .await?;
        Ok(result.as_deref() == Some("OK"))
    }

    async fn del(&self, key: &str) -> Result<bool> {
        let n: usize = self.query("DEL", &[key]).await?;
        Ok(n > 0)
    }

    async fn del_if_value(&self, key: &str, value: &str) -> Result<bool> {
        self.eval(DEL_IF_VALUE, key, &[value]).await
    }

    async fn expire(&self, key: &str, expire: u64) -> Result<bool> {
        self.query("EXPIRE", &[key, &expire.to_string()]).await
    }

    async fn exists(&self, key: &str) -> Result<bool> {
        self.query("EXISTS", &[key]).await
    }

    async fn rpush(&self, key: &str, values: &[String]) -> Result<usize> {
        if values.is_empty() {
            return self.llen(key).await;
        }
        let mut args = vec![key];
        args.extend(values.iter().map(|v| v.as_str()));
        self.query("RPUSH", &args).await
    }

    async fn lpop(&self, key: &str) -> Result<Option<String>> {
        self.query("LPOP", &[key]).await
    }

    async fn llen(&self, key: &str) -> Result<usize> {
        self.query("LLEN", &[key]).await
    }

    async fn hset(&self, key: &str, field: &str, value: &str) -> Result<()> {
        let _: usize = self.query("HSET", &[key, field, value]).await?;
        Ok(())
    }

    async fn hsetnx(&self, key: &str, field: &str, value: &str) -> Result<bool> {
        self.query("HSETNX", &[key, field, value]).await
    }

    async fn hswap(
        &self,
        key: &str,
        field: &str,
        value: &str,
    ) -> Result<Option<String>> {
        self.eval(HSWAP, key, &[field, value]).await
    }

    async fn hget(&self, key: &str, field: &str) -> Result<Option<String>> {
        self.query("HGET", &[key, field]).await
    }

    async fn hgetall(&self, key: &str) -> Result<HashMap<String, String>> {
        self.query("HGETALL", &[key]).await
    }
}

async fn check_node(node: &Client) -> Result<bool> {
    let mut conn = match get_connection(node, 1000).await {
        Ok(conn) => conn,
        Err(_) => return Err(anyhow!("can't get connection")),
    };
    let cmd = redis::cmd("PING");
    tokio::select! {
        _ = tokio::time::sleep(Duration::from_millis(1000)) => {
            Err(anyhow!("connection timeout"))
        }
        result = cmd.query_async(&mut conn) => {
            let result: String = result?;
            Ok(result == "PONG")
        }
    }
}
