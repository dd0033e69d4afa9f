//! # Network Manager
//!
//! 全フライトの状態とクラスタの正本を保持するコーディネータです。
//!
//! ## タイムステップごとの処理
//!
//! 1. **Status**: 全フライトから状態を受信
//! 2. **Telemetry**: 巡航集合を更新して巡航を外れたフライトを除外し、
//!    巡航中フライトから現在セグメントを受信
//! 3. **Proposal**: 巡航2機以上ならクラスタリングを実行し、全巡航フライトへ提案を送信
//! 4. **Vote**: 非空の提案を受けたフライトから可否を受信し、拒否したフライトを除外
//! 5. **Reconcile**: 実行クラスタ数を集計し、グラフを作り直してGRCを記録
//!
//! ループ終了後、各フライトから集計を受信します。

use std::collections::{BTreeMap, BTreeSet};

use tracing::{debug, info, trace};

use crate::comm::{CommError, Endpoint, Phase, Role, Tag, TrafficStats};
use crate::models::clustering::{ClusterMap, GroupingModel};
use crate::models::common::{FlightId, FlightStatus, SimulationClock};
use crate::models::flight::FlightSummary;
use crate::models::network::{AircraftNetwork, GrcStats};
use crate::models::trajectory::TrajectorySegment;
use crate::report::ResultsRow;

/// NMの実行結果
#[derive(Debug, Clone)]
pub struct CoordinatorReport {
    pub possible_clusters: u64,
    pub executed_clusters: u64,
    pub grc: GrcStats,
    pub results: Vec<ResultsRow>,
    pub flights: BTreeMap<FlightId, FlightSummary>,
    pub traffic: TrafficStats,
    /// 最終タイムステップ後のクラスタマップ
    pub final_clusters: ClusterMap,
}

/// Network Manager（コーディネータ）
#[derive(Debug)]
pub struct NetworkManager {
    flights: Vec<FlightId>,
    grouping: GroupingModel,
    radius_nm: f64,
    pub clusters: ClusterMap,
    pub cruise: BTreeSet<FlightId>,
    telemetry: BTreeMap<FlightId, TrajectorySegment>,
    pub possible_clusters: u64,
    pub executed_clusters: u64,
    pub grc: GrcStats,
    pub results: Vec<ResultsRow>,
}

impl NetworkManager {
    pub fn new(flights: Vec<FlightId>, grouping: GroupingModel, radius_nm: f64) -> Self {
        Self {
            clusters: ClusterMap::new(flights.iter().copied()),
            flights,
            grouping,
            radius_nm,
            cruise: BTreeSet::new(),
            telemetry: BTreeMap::new(),
            possible_clusters: 0,
            executed_clusters: 0,
            grc: GrcStats::default(),
            results: Vec::new(),
        }
    }

    /// 状態から巡航集合を更新し、巡航を外れたフライトをクラスタから除外
    pub fn update_cruise(&mut self, statuses: &BTreeMap<FlightId, FlightStatus>) {
        for (flight, status) in statuses {
            if *status == FlightStatus::Cruise {
                self.cruise.insert(*flight);
            } else if self.cruise.remove(flight) || self.clusters.is_clustered(*flight) {
                trace!("Flight {} を巡航集合から除外 ({})", flight, status);
                self.clusters.evict(*flight);
                self.telemetry.remove(flight);
            }
        }
    }

    /// クラスタリングを実行し、新たに提案されたクラスタ数を加算
    pub fn propose(&mut self, curr_time: i64) -> bool {
        let outcome = self.grouping.propose(
            &self.clusters,
            &self.telemetry,
            &self.cruise,
            self.radius_nm,
            curr_time,
        );
        let formed = outcome.clusters.count_new_clusters(&self.clusters) as u64;
        self.possible_clusters += formed;
        if outcome.changed {
            debug!("t={} NMクラスタ: {}", curr_time, outcome.clusters.describe());
        }
        self.clusters = outcome.clusters;
        outcome.has_clusters
    }

    /// 拒否したフライトを除外し、合意されたクラスタ数を加算
    pub fn reconcile_votes(&mut self, votes: &BTreeMap<FlightId, bool>, before: &ClusterMap) {
        for (flight, accepted) in votes {
            if !accepted {
                trace!("Flight {} がクラスタを拒否", flight);
                self.clusters.evict(*flight);
            }
        }
        self.executed_clusters += self.clusters.count_new_clusters(before) as u64;
    }

    /// 巡航2機以上ならGRCを計算して結果行を記録
    pub fn record_centrality(&mut self, curr_time: i64) -> Option<f64> {
        if self.cruise.len() < 2 {
            return None;
        }
        let network = AircraftNetwork::from_clusters(self.cruise.iter().copied(), &self.clusters);
        let grc = network.global_reaching_centrality();
        self.grc.record(grc);
        self.results.push(ResultsRow {
            time: curr_time,
            cruise_flights: self.cruise.len(),
            possible_clusters: self.possible_clusters,
            executed_clusters: self.executed_clusters,
            grc,
        });
        Some(grc)
    }

    /// シミュレーションループ
    pub async fn run(mut self, mut endpoint: Endpoint, clock: SimulationClock) -> Result<CoordinatorReport, CommError> {
        info!(
            "NM 開始: {}機, t={}..{} (Δt={}s)",
            self.flights.len(),
            clock.init_time,
            clock.end_time,
            clock.time_step
        );

        let total = clock.tick_count();
        let report_every = (total / 10).max(1);
        for (step, curr_time) in clock.ticks().enumerate() {
            trace!("t={} ----------------", curr_time);
            if step % report_every == 0 {
                info!(
                    "進行状況: {:.1}% (t={}, 巡航 {}機)",
                    step as f64 * 100.0 / total as f64,
                    curr_time,
                    self.cruise.len()
                );
            }
            let mut statuses = BTreeMap::new();
            for flight in &self.flights {
                let status: FlightStatus = endpoint.recv(Role::FlightAgent(*flight), Tag::Status).await?;
                statuses.insert(*flight, status);
            }
            endpoint.complete_phase(Phase::Status).await?;

            self.update_cruise(&statuses);
            debug_assert!(self.clusters.is_symmetric() && self.clusters.is_partition());
            let cruising: Vec<FlightId> = self.cruise.iter().copied().collect();
            for flight in &cruising {
                let segment: TrajectorySegment = endpoint.recv(Role::FlightAgent(*flight), Tag::Telemetry).await?;
                self.telemetry.insert(*flight, segment);
            }
            endpoint.complete_phase(Phase::Telemetry).await?;

            let before = self.clusters.clone();
            if cruising.len() >= 2 {
                self.propose(curr_time);
            }
            let mut proposed = Vec::new();
            for flight in &cruising {
                let members = self.clusters.members(*flight);
                if !members.is_empty() {
                    proposed.push(*flight);
                }
                endpoint.send(Role::FlightAgent(*flight), Tag::NmClusters, &members)?;
            }
            endpoint.complete_phase(Phase::Proposal).await?;

            let mut votes = BTreeMap::new();
            for flight in &proposed {
                let accepted: bool = endpoint.recv(Role::FlightAgent(*flight), Tag::AcceptanceVote).await?;
                votes.insert(*flight, accepted);
            }
            endpoint.complete_phase(Phase::Vote).await?;

            self.reconcile_votes(&votes, &before);
            debug_assert!(self.clusters.is_symmetric() && self.clusters.is_partition());
            if let Some(grc) = self.record_centrality(curr_time) {
                trace!(
                    "t={} 巡航 {} 提案 {} 実行 {} GRC {:.4}",
                    curr_time,
                    cruising.len(),
                    self.possible_clusters,
                    self.executed_clusters,
                    grc
                );
            }
            endpoint.complete_phase(Phase::Reconcile).await?;
        }

        let mut flights = BTreeMap::new();
        for flight in &self.flights {
            let summary: FlightSummary = endpoint.recv(Role::FlightAgent(*flight), Tag::SimulationSummary).await?;
            flights.insert(*flight, summary);
        }
        info!(
            "NM 完了: 提案クラスタ {}, 実行クラスタ {}, GRC更新 {}",
            self.possible_clusters, self.executed_clusters, self.grc.updates
        );

        Ok(CoordinatorReport {
            possible_clusters: self.possible_clusters,
            executed_clusters: self.executed_clusters,
            grc: self.grc,
            results: self.results,
            flights,
            traffic: endpoint.stats().clone(),
            final_clusters: self.clusters,
        })
    }
}
