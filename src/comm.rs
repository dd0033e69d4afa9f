//! # Comm モジュール
//!
//! Network Manager（NM）と各フライトエージェント間のメッセージ転送を提供します。
//!
//! 各参加者は [`Endpoint`] を1つ所有し、送信は非同期の投げっぱなし、
//! 受信は（送信者, タグ）が一致するメッセージが届くまでブロックします。
//! 一致しないメッセージは保留キューに積まれ、後の受信で取り出されます。
//! ペイロードは `serde_json` で符号化されるため、バイト数の集計は実際の
//! 転送量になり、復号できない本文は致命的な通信エラーになります。
//!
//! ## タイムステップのフェーズ
//!
//! 1タイムステップは Status → Telemetry → Proposal → Vote → Reconcile の
//! 5フェーズで構成され、各フェーズの終わりで全参加者（NM + 全フライト）が
//! 1つのバリアで同期します。フェーズ順序の逸脱はエラーとして検出されます。

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use serde::{de::DeserializeOwned, Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::{mpsc, Barrier};
use tokio::time::Instant;
use tracing::trace;

use crate::models::common::FlightId;

/// 参加者の役割
///
/// 転送層の番号付けとは独立に、トポロジ構築時に割り当てられます。
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Role {
    Coordinator,
    FlightAgent(FlightId),
}

impl Role {
    pub fn is_flight(&self) -> bool {
        matches!(self, Role::FlightAgent(_))
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Role::Coordinator => f.write_str("NM"),
            Role::FlightAgent(id) => write!(f, "Flight {}", id),
        }
    }
}

/// 論理チャネルを区別するメッセージタグ
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Tag {
    Status,
    Telemetry,
    NmClusters,
    AcceptanceVote,
    Clustered,
    Approaching,
    FlockingState,
    SimulationSummary,
}

/// 転送単位
#[derive(Debug, Clone)]
pub struct Envelope {
    pub from: Role,
    pub tag: Tag,
    pub body: Vec<u8>,
}

/// タイムステップ内のフェーズ
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Status,
    Telemetry,
    Proposal,
    Vote,
    Reconcile,
}

impl Phase {
    pub fn next(self) -> Phase {
        match self {
            Phase::Status => Phase::Telemetry,
            Phase::Telemetry => Phase::Proposal,
            Phase::Proposal => Phase::Vote,
            Phase::Vote => Phase::Reconcile,
            Phase::Reconcile => Phase::Status,
        }
    }
}

/// 通信エラー（すべて致命的）
#[derive(Debug, Error)]
pub enum CommError {
    #[error("宛先 {0} はトポロジに存在しません")]
    UnknownPeer(Role),
    #[error("{0} との通信路が切断されました")]
    Disconnected(Role),
    #[error("{from} からの {tag:?} メッセージ受信が {timeout:?} でタイムアウトしました")]
    Timeout {
        from: Role,
        tag: Tag,
        timeout: Duration,
    },
    #[error("{from} からの {tag:?} メッセージを復号できません: {source}")]
    Malformed {
        from: Role,
        tag: Tag,
        #[source]
        source: serde_json::Error,
    },
    #[error("メッセージの符号化に失敗しました: {0}")]
    Encode(#[from] serde_json::Error),
    #[error("フェーズ順序違反: 期待 {expected:?}, 実際 {actual:?}")]
    PhaseOrder { expected: Phase, actual: Phase },
    #[error("{0:?} フェーズの同期待ちがタイムアウトしました")]
    BarrierTimeout(Phase),
}

/// 送受信の統計
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MessageStats {
    pub bytes_sent: u64,
    pub bytes_received: u64,
    pub msgs_sent: u64,
    pub msgs_received: u64,
    pub sending_time: f64,
    pub receiving_time: f64,
}

/// 全体の通信量と、フライト間（クラスタ内）通信量
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TrafficStats {
    pub overall: MessageStats,
    pub clustered: MessageStats,
}

/// 1参加者分の通信端点
pub struct Endpoint {
    role: Role,
    inbox: mpsc::UnboundedReceiver<Envelope>,
    pending: VecDeque<Envelope>,
    directory: Arc<HashMap<Role, mpsc::UnboundedSender<Envelope>>>,
    barrier: Arc<Barrier>,
    phase: Phase,
    receive_timeout: Option<Duration>,
    stats: TrafficStats,
}

impl Endpoint {
    pub fn role(&self) -> Role {
        self.role
    }

    pub fn stats(&self) -> &TrafficStats {
        &self.stats
    }

    /// 現在待機中のフェーズ
    pub fn phase(&self) -> Phase {
        self.phase
    }

    fn is_clustered_link(&self, peer: Role) -> bool {
        self.role.is_flight() && peer.is_flight()
    }

    /// メッセージを送信（ブロックしない）
    pub fn send<T: Serialize>(&mut self, to: Role, tag: Tag, payload: &T) -> Result<(), CommError> {
        let started = Instant::now();
        let body = serde_json::to_vec(payload)?;
        let bytes = body.len() as u64;
        let sender = self.directory.get(&to).ok_or(CommError::UnknownPeer(to))?;
        sender
            .send(Envelope {
                from: self.role,
                tag,
                body,
            })
            .map_err(|_| CommError::Disconnected(to))?;
        let elapsed = started.elapsed().as_secs_f64();

        trace!("{} -> {} {:?} ({} bytes)", self.role, to, tag, bytes);
        let clustered = self.is_clustered_link(to);
        for stats in self.stats_targets(clustered) {
            stats.msgs_sent += 1;
            stats.bytes_sent += bytes;
            stats.sending_time += elapsed;
        }
        Ok(())
    }

    /// （送信者, タグ）が一致するメッセージを受信するまで待機
    pub async fn recv<T: DeserializeOwned>(&mut self, from: Role, tag: Tag) -> Result<T, CommError> {
        let started = Instant::now();
        let envelope = match self.take_pending(from, tag) {
            Some(envelope) => envelope,
            None => self.wait_for(from, tag, started).await?,
        };
        let elapsed = started.elapsed().as_secs_f64();

        let bytes = envelope.body.len() as u64;
        let clustered = self.is_clustered_link(from);
        for stats in self.stats_targets(clustered) {
            stats.msgs_received += 1;
            stats.bytes_received += bytes;
            stats.receiving_time += elapsed;
        }

        serde_json::from_slice(&envelope.body).map_err(|source| CommError::Malformed {
            from,
            tag,
            source,
        })
    }

    /// 全ピアに同じ情報を送り、全ピアからの応答を集める
    ///
    /// 自分自身は `peers` に含まれていても除外されます。
    pub async fn exchange<S, R>(
        &mut self,
        peers: &[FlightId],
        tag: Tag,
        payload: &S,
    ) -> Result<BTreeMap<FlightId, R>, CommError>
    where
        S: Serialize,
        R: DeserializeOwned,
    {
        let others: Vec<FlightId> = peers
            .iter()
            .copied()
            .filter(|id| Role::FlightAgent(*id) != self.role)
            .collect();
        for id in &others {
            self.send(Role::FlightAgent(*id), tag, payload)?;
        }
        let mut responses = BTreeMap::new();
        for id in others {
            let response = self.recv(Role::FlightAgent(id), tag).await?;
            responses.insert(id, response);
        }
        Ok(responses)
    }

    /// 現在フェーズの終了を全参加者で同期
    pub async fn complete_phase(&mut self, phase: Phase) -> Result<(), CommError> {
        if phase != self.phase {
            return Err(CommError::PhaseOrder {
                expected: self.phase,
                actual: phase,
            });
        }
        let wait = self.barrier.wait();
        match self.receive_timeout {
            Some(limit) => {
                tokio::time::timeout(limit, wait)
                    .await
                    .map_err(|_| CommError::BarrierTimeout(phase))?;
            }
            None => {
                wait.await;
            }
        }
        self.phase = phase.next();
        Ok(())
    }

    fn take_pending(&mut self, from: Role, tag: Tag) -> Option<Envelope> {
        let index = self
            .pending
            .iter()
            .position(|e| e.from == from && e.tag == tag)?;
        self.pending.remove(index)
    }

    async fn wait_for(&mut self, from: Role, tag: Tag, started: Instant) -> Result<Envelope, CommError> {
        loop {
            let next = match self.receive_timeout {
                Some(limit) => tokio::time::timeout_at(started + limit, self.inbox.recv())
                    .await
                    .map_err(|_| CommError::Timeout {
                        from,
                        tag,
                        timeout: limit,
                    })?,
                None => self.inbox.recv().await,
            };
            match next {
                Some(envelope) if envelope.from == from && envelope.tag == tag => return Ok(envelope),
                Some(envelope) => self.pending.push_back(envelope),
                None => return Err(CommError::Disconnected(from)),
            }
        }
    }

    fn stats_targets(&mut self, clustered: bool) -> Vec<&mut MessageStats> {
        let TrafficStats { overall, clustered: within } = &mut self.stats;
        if clustered {
            vec![overall, within]
        } else {
            vec![overall]
        }
    }
}

/// NM と全フライトの端点
pub struct Topology {
    pub coordinator: Endpoint,
    pub flights: BTreeMap<FlightId, Endpoint>,
}

impl Topology {
    /// 1つのNMと、指定IDのフライト群からトポロジを構築
    pub fn build(flight_ids: &[FlightId], receive_timeout: Option<Duration>) -> Topology {
        let barrier = Arc::new(Barrier::new(flight_ids.len() + 1));
        let mut senders = HashMap::new();

        let (coordinator_tx, coordinator_rx) = mpsc::unbounded_channel();
        senders.insert(Role::Coordinator, coordinator_tx);
        let mut inboxes = Vec::new();
        for id in flight_ids {
            let (tx, rx) = mpsc::unbounded_channel();
            senders.insert(Role::FlightAgent(*id), tx);
            inboxes.push((*id, rx));
        }
        let directory = Arc::new(senders);

        let endpoint = |role: Role, inbox: mpsc::UnboundedReceiver<Envelope>| Endpoint {
            role,
            inbox,
            pending: VecDeque::new(),
            directory: Arc::clone(&directory),
            barrier: Arc::clone(&barrier),
            phase: Phase::Status,
            receive_timeout,
            stats: TrafficStats::default(),
        };

        let flights = inboxes
            .into_iter()
            .map(|(id, inbox)| (id, endpoint(Role::FlightAgent(id), inbox)))
            .collect();
        Topology {
            coordinator: endpoint(Role::Coordinator, coordinator_rx),
            flights,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_recv_matches_sender_and_tag() {
        let Topology { mut coordinator, mut flights } = Topology::build(&[1, 2], None);
        let mut f1 = flights.remove(&1).unwrap();
        let mut f2 = flights.remove(&2).unwrap();

        f2.send(Role::Coordinator, Tag::Telemetry, &"telemetry-2").unwrap();
        f1.send(Role::Coordinator, Tag::Status, &"status-1").unwrap();
        f2.send(Role::Coordinator, Tag::Status, &"status-2").unwrap();

        // 到着順ではなく（送信者, タグ）で取り出す
        let s1: String = coordinator.recv(Role::FlightAgent(1), Tag::Status).await.unwrap();
        let s2: String = coordinator.recv(Role::FlightAgent(2), Tag::Status).await.unwrap();
        let t2: String = coordinator.recv(Role::FlightAgent(2), Tag::Telemetry).await.unwrap();
        assert_eq!((s1.as_str(), s2.as_str(), t2.as_str()), ("status-1", "status-2", "telemetry-2"));
        assert_eq!(coordinator.stats().overall.msgs_received, 3);
        assert_eq!(coordinator.stats().clustered.msgs_received, 0);
    }

    #[tokio::test]
    async fn test_flight_to_flight_traffic_counts_as_clustered() {
        let Topology { mut flights, .. } = Topology::build(&[1, 2], None);
        let mut f1 = flights.remove(&1).unwrap();
        let mut f2 = flights.remove(&2).unwrap();

        f1.send(Role::FlightAgent(2), Tag::Clustered, &true).unwrap();
        let got: bool = f2.recv(Role::FlightAgent(1), Tag::Clustered).await.unwrap();
        assert!(got);
        assert_eq!(f1.stats().clustered.msgs_sent, 1);
        assert_eq!(f1.stats().clustered.bytes_sent, 4);
        assert_eq!(f2.stats().clustered.bytes_received, 4);
        assert_eq!(f2.stats().overall, f2.stats().clustered);
    }

    #[tokio::test]
    async fn test_exchange_skips_self() {
        let Topology { mut flights, .. } = Topology::build(&[1, 2, 3], None);
        let ids = [1, 2, 3];
        let mut handles = Vec::new();
        for id in ids {
            let mut ep = flights.remove(&id).unwrap();
            handles.push(tokio::spawn(async move {
                let answers: BTreeMap<FlightId, u32> =
                    ep.exchange(&ids, Tag::FlockingState, &(id * 10)).await.unwrap();
                (id, answers)
            }));
        }
        for handle in handles {
            let (id, answers) = handle.await.unwrap();
            assert_eq!(answers.len(), 2);
            assert!(!answers.contains_key(&id));
            for (peer, value) in answers {
                assert_eq!(value, peer * 10);
            }
        }
    }

    #[tokio::test]
    async fn test_malformed_body_is_fatal() {
        let Topology { mut coordinator, mut flights } = Topology::build(&[1], None);
        let mut f1 = flights.remove(&1).unwrap();
        f1.send(Role::Coordinator, Tag::Status, &"not a number").unwrap();
        let result: Result<u32, CommError> = coordinator.recv(Role::FlightAgent(1), Tag::Status).await;
        assert!(matches!(result, Err(CommError::Malformed { .. })));
    }

    #[tokio::test]
    async fn test_receive_timeout_surfaces_silent_peer() {
        let Topology { mut coordinator, .. } = Topology::build(&[1], Some(Duration::from_millis(50)));
        let result: Result<bool, CommError> = coordinator.recv(Role::FlightAgent(1), Tag::AcceptanceVote).await;
        assert!(matches!(result, Err(CommError::Timeout { .. })));
    }

    #[tokio::test]
    async fn test_phase_order_is_enforced() {
        let Topology { mut coordinator, mut flights } = Topology::build(&[1], None);
        let mut f1 = flights.remove(&1).unwrap();
        assert!(matches!(
            coordinator.complete_phase(Phase::Vote).await,
            Err(CommError::PhaseOrder { expected: Phase::Status, actual: Phase::Vote })
        ));

        let flight = tokio::spawn(async move {
            f1.complete_phase(Phase::Status).await.unwrap();
            f1.phase()
        });
        coordinator.complete_phase(Phase::Status).await.unwrap();
        assert_eq!(coordinator.phase(), Phase::Telemetry);
        assert_eq!(flight.await.unwrap(), Phase::Telemetry);
    }

    #[test]
    fn test_unknown_peer_is_rejected() {
        let Topology { mut coordinator, .. } = Topology::build(&[1], None);
        let result = coordinator.send(Role::FlightAgent(7), Tag::NmClusters, &Vec::<FlightId>::new());
        assert!(matches!(result, Err(CommError::UnknownPeer(Role::FlightAgent(7)))));
    }
}
