use std::collections::BTreeSet;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info, trace};

use crate::comm::{CommError, Endpoint, Phase, Role, Tag, TrafficStats};
use crate::models::common::{FlightId, FlightStatus, SimulationClock};
use crate::models::negotiation::{
    negotiate, CooperationParams, JoinState, NegotiationContext, NegotiationOutcome, RejectReason,
};
use crate::models::trajectory::{FlightPlan, TrajectoryError};

/// フライトエージェントのエラー
#[derive(Debug, Error)]
pub enum AgentError {
    #[error(transparent)]
    Comm(#[from] CommError),
    #[error(transparent)]
    Trajectory(#[from] TrajectoryError),
}

/// シミュレーション終了時にNMへ送る集計
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FlightSummary {
    pub original_fuel: f64,
    pub cooperative_fuel: f64,
    pub clusters_joined: u32,
    /// クラスタ飛行した時間（秒）
    pub clustered_duration_s: i64,
    pub flown_with: Vec<FlightId>,
    pub traffic: TrafficStats,
}

/// フライトエージェント
///
/// 自分の飛行計画だけを保持し、NMとの通信とクラスタ交渉を通じて
/// 現タイムステップと次タイムステップのセグメントを書き換えます。
#[derive(Debug)]
pub struct FlightAgent {
    pub plan: FlightPlan,
    params: Arc<CooperationParams>,
    pub status: FlightStatus,
    /// 現在のセグメント番号
    pub timestep: usize,
    /// 直近で合意したクラスタ（不成立なら空）
    pub current_cluster: Vec<FlightId>,
    join: JoinState,
    pub clustered_steps: u32,
    pub clusters_joined: u32,
    pub flown_with: BTreeSet<FlightId>,
}

impl FlightAgent {
    pub fn new(plan: FlightPlan, params: Arc<CooperationParams>) -> Self {
        Self {
            plan,
            params,
            status: FlightStatus::NotStarted,
            timestep: 0,
            current_cluster: Vec::new(),
            join: JoinState::default(),
            clustered_steps: 0,
            clusters_joined: 0,
            flown_with: BTreeSet::new(),
        }
    }

    pub fn id(&self) -> FlightId {
        self.plan.id
    }

    /// 時刻から状態を更新し、遷移をログに残す
    pub fn update_status(&mut self, curr_time: i64) -> FlightStatus {
        let status = self.plan.status_at(curr_time);
        if status != self.status {
            info!("Flight {} {} -> {} (t={})", self.id(), self.status, status, curr_time);
        }
        self.status = status;
        status
    }

    /// 交渉結果を現在と次のセグメントに反映
    pub fn apply_outcome(&mut self, outcome: &NegotiationOutcome) -> Result<(), TrajectoryError> {
        let t = self.timestep;
        let (position, level, factor) = match outcome {
            NegotiationOutcome::Rejected(RejectReason::NotProposed) => return Ok(()),
            NegotiationOutcome::Accepted {
                cluster,
                position,
                level,
                ..
            } => {
                self.clustered_steps += 1;
                if *cluster != self.current_cluster {
                    self.clusters_joined += 1;
                }
                let own = self.id();
                self.flown_with
                    .extend(cluster.iter().copied().filter(|id| *id != own));
                self.current_cluster = cluster.clone();
                (*position, *level, self.params.coop_fuel_parameter)
            }
            NegotiationOutcome::Rejected(_) => {
                self.current_cluster.clear();
                let next = self.plan.segment(t + 1)?;
                (next.init_position(), next.level_init, self.params.alone_fuel_parameter)
            }
        };

        let kd = self.plan.kd;
        let own = self.plan.id;
        let next = self.plan.segment_mut(t + 1)?;
        next.lat_init = position.lat;
        next.lon_init = position.lon;
        next.level_init = level;

        let current = self.plan.segment_mut(t)?;
        current.lat_end = position.lat;
        current.lon_end = position.lon;
        current.level_end = level;
        current.fuel = kd * current.geodesic_length_nm() * factor;
        trace!(
            "Flight {} segment {} fuel {:.3} kg (factor {})",
            own, t, current.fuel, factor
        );
        Ok(())
    }

    pub fn summary(&self, traffic: TrafficStats) -> FlightSummary {
        FlightSummary {
            original_fuel: self.plan.planned_fuel(),
            cooperative_fuel: self.plan.simulated_fuel(),
            clusters_joined: self.clusters_joined,
            clustered_duration_s: self.clustered_steps as i64 * self.params.time_step,
            flown_with: self.flown_with.iter().copied().collect(),
            traffic,
        }
    }

    /// シミュレーションループ
    pub async fn run(mut self, mut endpoint: Endpoint, clock: SimulationClock) -> Result<FlightSummary, AgentError> {
        debug!(
            "Flight {} 巡航 {}s 降下 {}s Kd {:.4}",
            self.id(),
            self.plan.cruise_time,
            self.plan.descent_time,
            self.plan.kd
        );

        for curr_time in clock.ticks() {
            let status = self.update_status(curr_time);
            endpoint.send(Role::Coordinator, Tag::Status, &status)?;
            endpoint.complete_phase(Phase::Status).await?;

            let cruising = status == FlightStatus::Cruise;
            if cruising {
                let telemetry = self.plan.segment(self.timestep)?;
                endpoint.send(Role::Coordinator, Tag::Telemetry, telemetry)?;
            }
            endpoint.complete_phase(Phase::Telemetry).await?;

            let proposal: Vec<FlightId> = if cruising {
                endpoint.recv(Role::Coordinator, Tag::NmClusters).await?
            } else {
                Vec::new()
            };
            endpoint.complete_phase(Phase::Proposal).await?;

            if !proposal.is_empty() {
                let accepted = self.cooperate(&mut endpoint, curr_time, &proposal).await?;
                endpoint.send(Role::Coordinator, Tag::AcceptanceVote, &accepted)?;
            }
            endpoint.complete_phase(Phase::Vote).await?;

            if status.is_airborne() {
                self.timestep += 1;
            }
            endpoint.complete_phase(Phase::Reconcile).await?;
        }

        let summary = self.summary(endpoint.stats().clone());
        info!(
            "Flight {} 完了: 燃料 {:.1} -> {:.1} kg, クラスタ {}回",
            self.id(),
            summary.original_fuel,
            summary.cooperative_fuel,
            summary.clusters_joined
        );
        endpoint.send(Role::Coordinator, Tag::SimulationSummary, &summary)?;
        Ok(summary)
    }

    /// 提案に対して交渉し、結果を計画に反映して可否を返す
    async fn cooperate(
        &mut self,
        endpoint: &mut Endpoint,
        curr_time: i64,
        proposal: &[FlightId],
    ) -> Result<bool, AgentError> {
        let outcome = {
            let ctx = NegotiationContext {
                flight: self.plan.id,
                params: &self.params,
                current: self.plan.segment(self.timestep)?,
                top_of_descent: self.plan.top_of_descent.position,
                kd: self.plan.kd,
                curr_time,
                descent_time: self.plan.descent_time,
            };
            negotiate(endpoint, &ctx, proposal, &mut self.join).await?
        };
        self.apply_outcome(&outcome)?;
        match &outcome {
            NegotiationOutcome::Accepted { cluster, joined, .. } => {
                debug!("Flight {} クラスタ {:?} 合意 (joined: {})", self.id(), cluster, joined);
            }
            NegotiationOutcome::Rejected(reason) => {
                debug!("Flight {} 単独飛行を継続 ({})", self.id(), reason);
            }
        }
        Ok(outcome.is_accepted())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::common::GeoPosition;
    use crate::models::flocking::FlockingModel;
    use crate::models::trajectory::fixtures::straight_plan;

    fn params() -> Arc<CooperationParams> {
        Arc::new(CooperationParams {
            model: FlockingModel::Vicsek,
            time_step: 10,
            alone_fuel_parameter: 1.0,
            coop_fuel_parameter: 0.8,
            approached_distance_m: 500.0,
            max_negotiation_rounds: None,
        })
    }

    fn agent_at_cruise() -> FlightAgent {
        let plan = straight_plan(1, 0, GeoPosition::new(45.0, 0.0), 0.0, 10);
        let mut agent = FlightAgent::new(plan, params());
        agent.timestep = 4;
        agent
    }

    #[test]
    fn test_accepted_outcome_rewrites_current_and_next_segment() {
        let mut agent = agent_at_cruise();
        let moved = agent.plan.segments[4].init_position().project(10.0, 2000.0);
        let outcome = NegotiationOutcome::Accepted {
            cluster: vec![1, 2],
            position: moved,
            level: 360,
            joined: true,
        };

        agent.apply_outcome(&outcome).unwrap();

        let current = &agent.plan.segments[4];
        let next = &agent.plan.segments[5];
        assert_eq!(current.end_position(), moved);
        assert_eq!(current.level_end, 360);
        assert_eq!(next.init_position(), moved);
        assert_eq!(next.level_init, 360);
        let expected = agent.plan.kd * current.geodesic_length_nm() * 0.8;
        assert!((current.fuel - expected).abs() < 1e-9);
        assert_eq!(agent.clustered_steps, 1);
        assert_eq!(agent.clusters_joined, 1);
        assert_eq!(agent.flown_with, BTreeSet::from([2]));
        assert!(agent.plan.is_modified());
    }

    #[test]
    fn test_same_cluster_is_counted_once() {
        let mut agent = agent_at_cruise();
        let outcome = NegotiationOutcome::Accepted {
            cluster: vec![1, 2],
            position: agent.plan.segments[5].init_position(),
            level: 350,
            joined: true,
        };
        agent.apply_outcome(&outcome).unwrap();
        agent.timestep += 1;
        agent.apply_outcome(&outcome).unwrap();

        assert_eq!(agent.clustered_steps, 2);
        assert_eq!(agent.clusters_joined, 1);
        assert_eq!(agent.summary(TrafficStats::default()).clustered_duration_s, 20);
    }

    #[test]
    fn test_rejected_outcome_snaps_back_to_plan() {
        let mut agent = agent_at_cruise();
        let planned_next = agent.plan.planned[5].init_position();

        agent
            .apply_outcome(&NegotiationOutcome::Rejected(RejectReason::FuelCost))
            .unwrap();

        let current = &agent.plan.segments[4];
        assert_eq!(current.end_position(), planned_next);
        assert_eq!(agent.plan.segments[5].init_position(), planned_next);
        let expected = agent.plan.kd * current.geodesic_length_nm() * 1.0;
        assert!((current.fuel - expected).abs() < 1e-9);
        assert_eq!(agent.clustered_steps, 0);
        assert!(agent.current_cluster.is_empty());
    }

    #[test]
    fn test_not_proposed_leaves_plan_untouched() {
        let mut agent = agent_at_cruise();
        agent
            .apply_outcome(&NegotiationOutcome::Rejected(RejectReason::NotProposed))
            .unwrap();
        assert!(!agent.plan.is_modified());
    }

    #[test]
    fn test_missing_next_segment_is_an_error() {
        let mut agent = agent_at_cruise();
        agent.timestep = agent.plan.segments.len() - 1;
        let result = agent.apply_outcome(&NegotiationOutcome::Rejected(RejectReason::Alone));
        assert!(matches!(result, Err(TrajectoryError::MissingSegment { .. })));
    }

    #[test]
    fn test_status_follows_clock() {
        let mut agent = agent_at_cruise();
        assert_eq!(agent.update_status(-10), FlightStatus::NotStarted);
        assert_eq!(agent.update_status(0), FlightStatus::Climb);
        assert_eq!(agent.update_status(agent.plan.cruise_time), FlightStatus::Cruise);
        assert_eq!(agent.update_status(agent.plan.descent_time), FlightStatus::Descent);
        assert_eq!(agent.update_status(agent.plan.end_time), FlightStatus::Finished);
    }
}
