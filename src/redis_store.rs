//! Redis-backed [`RemoteStore`], single node or cluster

use std::collections::BTreeSet;
use std::sync::atomic::{AtomicUsize, Ordering};

use async_trait::async_trait;
use futures::StreamExt;
use redis::aio::{ConnectionLike, ConnectionManager, ConnectionManagerConfig};
use redis::cluster::ClusterClientBuilder;
use redis::cluster_async::ClusterConnection;
use redis::{
    AsyncCommands, Client, Cmd, ConnectionAddr, ConnectionInfo, Pipeline, RedisConnectionInfo,
    RedisFuture, Value,
};
use tracing::{info, warn};

use crate::CacheError;
use crate::config::L2Config;
use crate::remote::{MessageStream, RemoteStore};

/// A `host:port` endpoint.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
pub struct Node {
    pub host: String,
    pub port: u16,
}

/// Parse a comma-separated `host:port` list.
///
/// Malformed items are skipped with a warning and duplicates collapse; an
/// empty result is a configuration error.
pub fn parse_nodes(nodes: &str) -> Result<Vec<Node>, CacheError> {
    let mut parsed = BTreeSet::new();
    for item in nodes.split(',').map(str::trim).filter(|s| !s.is_empty()) {
        let Some((host, port)) = item.split_once(':') else {
            warn!("Ignoring Redis node without port: {}", item);
            continue;
        };
        match port.parse::<u16>() {
            Ok(port) if !host.is_empty() && !host.contains(':') => {
                parsed.insert(Node {
                    host: host.to_owned(),
                    port,
                });
            }
            _ => warn!("Ignoring malformed Redis node: {}", item),
        }
    }
    if parsed.is_empty() {
        return Err(CacheError::config("l2.nodes can not be empty"));
    }
    Ok(parsed.into_iter().collect())
}

fn connection_infos(
    nodes: &[Node],
    username: Option<String>,
    password: Option<String>,
) -> Vec<ConnectionInfo> {
    nodes
        .iter()
        .map(|node| ConnectionInfo {
            addr: ConnectionAddr::Tcp(node.host.clone(), node.port),
            redis: RedisConnectionInfo {
                username: username.clone(),
                password: password.clone(),
                ..Default::default()
            },
        })
        .collect()
}

/// One client per configured node for dedicated pub/sub connections.
///
/// Each subscription attempt takes the next node in turn, so a listener
/// retrying after an error moves on from a node that is down. Redis Cluster
/// forwards PUBLISH to every node, so any of them receives all messages.
struct PubSubNodes {
    clients: Vec<Client>,
    next: AtomicUsize,
}

impl PubSubNodes {
    /// `infos` must not be empty.
    fn new(infos: &[ConnectionInfo]) -> Result<Self, CacheError> {
        let clients = infos
            .iter()
            .map(|info| Client::open(info.clone()))
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Self {
            clients,
            next: AtomicUsize::new(0),
        })
    }

    fn first(&self) -> &Client {
        &self.clients[0]
    }

    fn next(&self) -> &Client {
        let i = self.next.fetch_add(1, Ordering::Relaxed) % self.clients.len();
        &self.clients[i]
    }
}

/// Multiplexed command connection, single node or cluster.
#[derive(Clone)]
enum Connection {
    Single(ConnectionManager),
    Cluster(ClusterConnection),
}

impl ConnectionLike for Connection {
    fn req_packed_command<'a>(&'a mut self, cmd: &'a Cmd) -> RedisFuture<'a, Value> {
        match self {
            Self::Single(conn) => conn.req_packed_command(cmd),
            Self::Cluster(conn) => conn.req_packed_command(cmd),
        }
    }

    fn req_packed_commands<'a>(
        &'a mut self,
        cmd: &'a Pipeline,
        offset: usize,
        count: usize,
    ) -> RedisFuture<'a, Vec<Value>> {
        match self {
            Self::Single(conn) => conn.req_packed_commands(cmd, offset, count),
            Self::Cluster(conn) => conn.req_packed_commands(cmd, offset, count),
        }
    }

    fn get_db(&self) -> i64 {
        match self {
            Self::Single(conn) => conn.get_db(),
            Self::Cluster(conn) => conn.get_db(),
        }
    }
}

/// Redis store holding either a single-node connection manager or a cluster
/// connection, never both.
pub struct RedisStore {
    conn: Connection,
    pubsub: PubSubNodes,
    connect_timeout: std::time::Duration,
    description: String,
}

impl RedisStore {
    pub async fn connect(config: &L2Config) -> Result<Self, CacheError> {
        let nodes = parse_nodes(&config.nodes)?;
        let (username, password) = config.credentials();

        let infos = connection_infos(&nodes, username.clone(), password.clone());
        let pubsub = PubSubNodes::new(&infos)?;

        let (conn, description) = if infos.len() > 1 {
            let mut builder = ClusterClientBuilder::new(infos.clone())
                .connection_timeout(config.connection_timeout())
                .response_timeout(config.response_timeout())
                .retries(config.max_attempts);
            if let Some(username) = &username {
                builder = builder.username(username.clone());
            }
            if let Some(password) = &password {
                builder = builder.password(password.clone());
            }
            let client = builder.build()?;
            let conn = client.get_async_connection().await.inspect_err(|e| {
                warn!("Redis cluster initialization failed: {}", e);
            })?;
            let description = format!("redis cluster ({} nodes)", infos.len());
            info!("Redis cluster connection initialized: {} nodes", infos.len());
            (Connection::Cluster(conn), description)
        } else {
            let manager_config = ConnectionManagerConfig::new()
                .set_connection_timeout(config.connection_timeout())
                .set_response_timeout(config.response_timeout())
                .set_number_of_retries(config.max_attempts as usize);
            let conn = ConnectionManager::new_with_config(pubsub.first().clone(), manager_config)
                .await
                .inspect_err(|e| {
                    warn!("Redis connection initialization failed: {}", e);
                })?;
            let description = format!("redis {}:{}", nodes[0].host, nodes[0].port);
            info!("Redis connection initialized: {}:{}", nodes[0].host, nodes[0].port);
            (Connection::Single(conn), description)
        };

        Ok(Self {
            conn,
            pubsub,
            connect_timeout: config.connection_timeout(),
            description,
        })
    }

    /// Per-call handle onto the multiplexed connection.
    fn connection(&self) -> Connection {
        self.conn.clone()
    }
}

#[async_trait]
impl RemoteStore for RedisStore {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, CacheError> {
        let mut conn = self.connection();
        Ok(conn.get::<_, Option<Vec<u8>>>(key).await?)
    }

    async fn set(&self, key: &str, value: Vec<u8>, ttl_ms: Option<u64>) -> Result<(), CacheError> {
        let mut conn = self.connection();
        match ttl_ms {
            Some(ms) => conn.pset_ex::<_, _, ()>(key, value, ms).await?,
            None => conn.set::<_, _, ()>(key, value).await?,
        }
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<(), CacheError> {
        let mut conn = self.connection();
        conn.del::<_, ()>(key).await?;
        Ok(())
    }

    async fn exists(&self, key: &str) -> Result<bool, CacheError> {
        let mut conn = self.connection();
        Ok(conn.exists::<_, bool>(key).await?)
    }

    async fn publish(&self, channel: &str, payload: Vec<u8>) -> Result<(), CacheError> {
        let mut conn = self.connection();
        conn.publish::<_, _, ()>(channel, payload).await?;
        Ok(())
    }

    async fn subscribe(&self, channel: &str) -> Result<MessageStream, CacheError> {
        let client = self.pubsub.next();
        let addr = &client.get_connection_info().addr;
        let mut pubsub = tokio::time::timeout(self.connect_timeout, client.get_async_pubsub())
            .await
            .map_err(|_| CacheError::Transport(format!("pub/sub connect to {addr} timed out")))??;
        pubsub.subscribe(channel).await?;
        info!("Subscribed to channel {} on {} via {}", channel, self.description, addr);

        let stream = pubsub
            .into_on_message()
            .map(|msg| msg.get_payload_bytes().to_vec());
        Ok(stream.boxed())
    }

    fn describe(&self) -> String {
        self.description.clone()
    }
}
