//! # Simulation モジュール
//!
//! 協調飛行シミュレーションの実行エンジンを提供します。
//!
//! 起動時に全フライトの飛行計画を一度だけ読み込み、NM（コーディネータ）1タスクと
//! フライトエージェントNタスクを生成して、シミュレーション時計が終わるまで
//! 走らせます。各タスクは自分の状態だけを所有し、メッセージとフェーズ同期
//! だけで協調します。
//!
//! ## 処理の流れ
//!
//! 1. **計画読み込み**: `ITrajectorySource` から各フライトのセグメントを取得し、
//!    巡航・降下時刻とKdを導出
//! 2. **時計決定**: 最早離陸時刻から最遅着陸時刻まで
//! 3. **タスク生成**: 役割ごとのスパン付きでNMと全フライトを起動
//! 4. **集計**: NMが受け取った各フライトの集計から `SimulationSummary` を作り、
//!    `IReportSink` へ出力
//!
//! いずれかのタスクが失敗した時点で残りのタスクを中断し、エラーを返します。
//!
//! ## 使用例
//!
//! ```rust,ignore
//! let scenario = ScenarioConfig::from_file("scenarios/line_abreast.yaml")?;
//! let engine = SimulationEngine::new(&scenario)?;
//! let mut sink = FileReportSink::create(&scenario.output.dir)?;
//! let result = engine.run(&mut sink).await?;
//! ```

use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tokio::task::{JoinError, JoinSet};
use tracing::{debug, error, info, info_span, Instrument};

use crate::comm::{CommError, Role, Topology};
use crate::models::clustering::{ClusterMap, GroupingModel};
use crate::models::common::{FlightId, SimulationClock};
use crate::models::flight::{AgentError, FlightAgent};
use crate::models::negotiation::CooperationParams;
use crate::models::network_manager::{CoordinatorReport, NetworkManager};
use crate::models::traits::{IReportSink, ITrajectorySource};
use crate::models::trajectory::{FlightPlan, TrajectoryError};
use crate::report::{ReportError, RunInfo, SimulationSummary};
use crate::scenario::{ScenarioConfig, ScenarioError};

/// シミュレーション実行エラー
#[derive(Debug, Error)]
pub enum SimError {
    #[error(transparent)]
    Scenario(#[from] ScenarioError),
    #[error(transparent)]
    Trajectory(#[from] TrajectoryError),
    #[error(transparent)]
    Comm(#[from] CommError),
    #[error(transparent)]
    Agent(#[from] AgentError),
    #[error(transparent)]
    Report(#[from] ReportError),
    #[error("タスクが異常終了しました: {0}")]
    Join(#[from] JoinError),
    #[error("飛行計画がないためシミュレーション時間を決定できません")]
    EmptyFleet,
}

/// 実行結果
#[derive(Debug, Clone)]
pub struct SimulationResult {
    pub summary: SimulationSummary,
    pub final_clusters: ClusterMap,
}

/// タスクの終了報告
enum TaskOutput {
    Coordinator(CoordinatorReport),
    Flight(FlightId),
}

pub struct SimulationEngine {
    pub plans: Vec<FlightPlan>,
    pub clock: SimulationClock,
    params: Arc<CooperationParams>,
    grouping: GroupingModel,
    radius_nm: f64,
    receive_timeout: Option<Duration>,
    run_info: RunInfo,
}

impl SimulationEngine {
    /// シナリオから飛行計画と協調パラメータを読み込む
    pub fn new(scenario: &ScenarioConfig) -> Result<Self, SimError> {
        let params = scenario.cooperation_params()?;
        let plans = load_plans(scenario, params.time_step)?;
        let clock = SimulationClock::from_spans(
            plans.iter().map(|p| (p.init_time, p.end_time)),
            params.time_step,
        )
        .ok_or(SimError::EmptyFleet)?;

        info!(
            "シミュレーションエンジン初期化: {}機, t={}..{} ({}ティック)",
            plans.len(),
            clock.init_time,
            clock.end_time,
            clock.tick_count()
        );

        Ok(Self {
            plans,
            clock,
            params: Arc::new(params),
            grouping: scenario.grouping()?,
            radius_nm: scenario.cooperation.radius_nm,
            receive_timeout: scenario.receive_timeout(),
            run_info: scenario.run_info(),
        })
    }

    /// 全タスクを起動し、終了後に結果をシンクへ出力
    pub async fn run(self, sink: &mut dyn IReportSink) -> Result<SimulationResult, SimError> {
        info!("=== シミュレーション実行開始 ===");
        let ids: Vec<FlightId> = self.plans.iter().map(|p| p.id).collect();
        let Topology { coordinator, flights } = Topology::build(&ids, self.receive_timeout);
        let clock = self.clock;

        let mut tasks = JoinSet::new();
        let manager = NetworkManager::new(ids, self.grouping, self.radius_nm);
        tasks.spawn(
            async move {
                let report = manager.run(coordinator, clock).await?;
                Ok::<_, SimError>(TaskOutput::Coordinator(report))
            }
            .instrument(info_span!("coordinator")),
        );

        // plans と flights はどちらもID昇順
        for (plan, (id, endpoint)) in self.plans.into_iter().zip(flights) {
            let agent = FlightAgent::new(plan, Arc::clone(&self.params));
            tasks.spawn(
                async move {
                    agent.run(endpoint, clock).await?;
                    Ok::<_, SimError>(TaskOutput::Flight(id))
                }
                .instrument(info_span!("flight", id)),
            );
        }

        let mut report = None;
        while let Some(joined) = tasks.join_next().await {
            match joined.map_err(SimError::from).and_then(|output| output) {
                Ok(TaskOutput::Coordinator(r)) => report = Some(r),
                Ok(TaskOutput::Flight(id)) => debug!("Flight {} タスク終了", id),
                Err(e) => {
                    error!("タスクが失敗したため残りを中断します: {}", e);
                    tasks.abort_all();
                    return Err(e);
                }
            }
        }
        let report = report.ok_or_else(|| CommError::Disconnected(Role::Coordinator))?;

        for row in &report.results {
            sink.write_results_row(row)?;
        }
        let summary = SimulationSummary::build(self.run_info, &report);
        sink.write_summary(&summary)?;

        info!("=== シミュレーション完了 ===");
        info!(
            "提案クラスタ {}, 実行クラスタ {} ({:.1}%), 燃料差 {:.1} kg",
            summary.possible_clusters,
            summary.executed_clusters,
            summary.acceptance_ratio,
            summary.fuel_difference
        );

        Ok(SimulationResult {
            summary,
            final_clusters: report.final_clusters,
        })
    }
}

/// 供給元から全フライトの計画を読み込む（ID昇順）
pub fn load_plans(source: &dyn ITrajectorySource, time_step: i64) -> Result<Vec<FlightPlan>, TrajectoryError> {
    source
        .flight_ids()
        .into_iter()
        .map(|id| FlightPlan::new(id, source.load(id)?, time_step))
        .collect()
}
