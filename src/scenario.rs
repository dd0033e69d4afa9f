use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

use crate::models::clustering::GroupingModel;
use crate::models::common::{constants::TIME_STEP_S, geodesy, FlightId};
use crate::models::flocking::FlockingModel;
use crate::models::negotiation::CooperationParams;
use crate::models::traits::ITrajectorySource;
use crate::models::trajectory::{TrajectoryError, TrajectorySegment};
use crate::report::RunInfo;

/// シナリオメタデータ
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ScenarioMeta {
    pub test_case_id: String,
    pub name: String,
    #[serde(default)]
    pub description: String,
}

/// シミュレーション設定
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct SimulationConfig {
    #[serde(default = "default_time_step")]
    pub time_step_s: i64,
    /// 受信待ちの上限（秒、未指定なら無制限）
    #[serde(default)]
    pub receive_timeout_s: Option<f64>,
    /// 燃料コストループの上限回数
    #[serde(default)]
    pub max_negotiation_rounds: Option<u32>,
}

fn default_time_step() -> i64 {
    TIME_STEP_S
}

/// 協調飛行の設定
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct CooperationConfig {
    pub model: String,
    pub grouping: String,
    pub radius_nm: f64,
    pub alone_fuel_parameter: f64,
    pub coop_fuel_parameter: f64,
    pub approached_distance_m: f64,
}

/// 実行環境（レポート用の記録のみ）
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct InfrastructureConfig {
    #[serde(default)]
    pub machines: Vec<String>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct OutputConfig {
    pub dir: PathBuf,
}

impl Default for OutputConfig {
    fn default() -> Self {
        Self {
            dir: PathBuf::from("output"),
        }
    }
}

/// ログ設定（CLI引数が優先）
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct LogSettings {
    #[serde(default)]
    pub level: Option<String>,
    #[serde(default)]
    pub output: Option<String>,
}

/// セグメント座標の表記
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum CoordinateFormat {
    /// 10進度
    #[default]
    Degrees,
    /// 10進分（eSO6形式）
    Minutes,
}

/// フライト1機分の飛行計画
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct FlightConfig {
    pub id: FlightId,
    #[serde(default)]
    pub coordinates: CoordinateFormat,
    pub segments: Vec<TrajectorySegment>,
}

/// 完全なシナリオ設定
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ScenarioConfig {
    pub meta: ScenarioMeta,
    pub sim: SimulationConfig,
    pub cooperation: CooperationConfig,
    #[serde(default)]
    pub infrastructure: InfrastructureConfig,
    #[serde(default)]
    pub output: OutputConfig,
    #[serde(default)]
    pub log: LogSettings,
    pub flights_quantity: usize,
    pub flights: Vec<FlightConfig>,
}

impl ScenarioConfig {
    /// YAMLファイルからシナリオ設定を読み込み
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self, ScenarioError> {
        let path = path.as_ref();

        if !path.exists() {
            return Err(ScenarioError::FileNotFound(path.to_path_buf()));
        }

        let contents = fs::read_to_string(path).map_err(|source| ScenarioError::Io {
            path: path.to_path_buf(),
            source,
        })?;

        let config: ScenarioConfig =
            serde_yaml::from_str(&contents).map_err(|source| ScenarioError::Parse {
                path: path.to_path_buf(),
                source,
            })?;

        config.validate()?;

        Ok(config)
    }

    /// 設定の基本的な検証
    pub fn validate(&self) -> Result<(), ScenarioError> {
        if self.sim.time_step_s <= 0 {
            return Err(ScenarioError::Validation("time_step_s must be positive".to_string()));
        }
        if let Some(timeout) = self.sim.receive_timeout_s {
            if timeout <= 0.0 {
                return Err(ScenarioError::Validation(
                    "receive_timeout_s must be positive".to_string(),
                ));
            }
        }
        if self.sim.max_negotiation_rounds == Some(0) {
            return Err(ScenarioError::Validation(
                "max_negotiation_rounds must be at least 1".to_string(),
            ));
        }

        self.flocking_model()?;
        self.grouping()?;
        if self.cooperation.radius_nm <= 0.0 {
            return Err(ScenarioError::Validation("radius_nm must be positive".to_string()));
        }
        if self.cooperation.approached_distance_m < 0.0 {
            return Err(ScenarioError::Validation(
                "approached_distance_m must not be negative".to_string(),
            ));
        }

        if self.flights.is_empty() {
            return Err(ScenarioError::Validation("No flights defined".to_string()));
        }
        if self.flights.len() != self.flights_quantity {
            return Err(ScenarioError::Validation(format!(
                "flights_quantity is {} but {} flights are defined",
                self.flights_quantity,
                self.flights.len()
            )));
        }

        // IDは1..Nをちょうど1回ずつ
        let ids: BTreeSet<FlightId> = self.flights.iter().map(|f| f.id).collect();
        let expected: BTreeSet<FlightId> = (1..=self.flights.len() as FlightId).collect();
        if ids != expected {
            return Err(ScenarioError::Validation(format!(
                "Flight ids must be 1..{} without duplicates, got {:?}",
                self.flights.len(),
                ids
            )));
        }

        let time_step = self.sim.time_step_s;
        for flight in &self.flights {
            if let Some(segment) = flight
                .segments
                .iter()
                .find(|s| s.time_end - s.time_init != time_step)
            {
                return Err(ScenarioError::Validation(format!(
                    "Flight {} segment at t={} does not span time_step_s ({}s)",
                    flight.id, segment.time_init, time_step
                )));
            }
            if let Some(pair) = flight
                .segments
                .windows(2)
                .find(|pair| pair[1].time_init != pair[0].time_end)
            {
                return Err(ScenarioError::Validation(format!(
                    "Flight {} segments are not contiguous at t={} (next starts at t={})",
                    flight.id, pair[0].time_end, pair[1].time_init
                )));
            }
        }

        // 全セグメントがフリート全体の時計の刻みに乗っていること
        if let Some(clock_start) = self
            .flights
            .iter()
            .filter_map(|f| f.segments.first())
            .map(|s| s.time_init)
            .min()
        {
            for flight in &self.flights {
                if let Some(segment) = flight
                    .segments
                    .iter()
                    .find(|s| (s.time_init - clock_start).rem_euclid(time_step) != 0)
                {
                    return Err(ScenarioError::Validation(format!(
                        "Flight {} segment at t={} is off the {}s clock grid starting at t={}",
                        flight.id, segment.time_init, time_step, clock_start
                    )));
                }
            }
        }

        Ok(())
    }

    pub fn flocking_model(&self) -> Result<FlockingModel, ScenarioError> {
        self.cooperation
            .model
            .parse()
            .map_err(ScenarioError::Validation)
    }

    pub fn grouping(&self) -> Result<GroupingModel, ScenarioError> {
        self.cooperation
            .grouping
            .parse()
            .map_err(ScenarioError::Validation)
    }

    /// フライトエージェントで共有する協調パラメータ
    pub fn cooperation_params(&self) -> Result<CooperationParams, ScenarioError> {
        Ok(CooperationParams {
            model: self.flocking_model()?,
            time_step: self.sim.time_step_s,
            alone_fuel_parameter: self.cooperation.alone_fuel_parameter,
            coop_fuel_parameter: self.cooperation.coop_fuel_parameter,
            approached_distance_m: self.cooperation.approached_distance_m,
            max_negotiation_rounds: self.sim.max_negotiation_rounds,
        })
    }

    pub fn receive_timeout(&self) -> Option<Duration> {
        self.sim.receive_timeout_s.map(Duration::from_secs_f64)
    }

    /// レポートに記録する実行条件
    pub fn run_info(&self) -> RunInfo {
        RunInfo {
            test_case_id: self.meta.test_case_id.clone(),
            scenario: self.meta.name.clone(),
            aircraft: self.flights_quantity,
            machines: self.infrastructure.machines.clone(),
            model: self.cooperation.model.to_lowercase(),
            grouping: self.cooperation.grouping.to_lowercase(),
            radius_nm: self.cooperation.radius_nm,
            alone_fuel_parameter: self.cooperation.alone_fuel_parameter,
            coop_fuel_parameter: self.cooperation.coop_fuel_parameter,
            approached_distance_m: self.cooperation.approached_distance_m,
        }
    }

    /// シナリオの概要を表示
    pub fn print_summary(&self) {
        println!("=== シナリオ情報 ===");
        println!("テストケース: {}", self.meta.test_case_id);
        println!("名前: {}", self.meta.name);
        println!("説明: {}", self.meta.description);
        println!();

        println!("=== シミュレーション設定 ===");
        println!("時間刻み: {}秒", self.sim.time_step_s);
        match self.sim.receive_timeout_s {
            Some(timeout) => println!("受信タイムアウト: {:.1}秒", timeout),
            None => println!("受信タイムアウト: なし"),
        }
        match self.sim.max_negotiation_rounds {
            Some(rounds) => println!("交渉ラウンド上限: {}", rounds),
            None => println!("交渉ラウンド上限: なし"),
        }
        println!();

        println!("=== 協調飛行 ===");
        println!("群れ飛行モデル: {}", self.cooperation.model);
        println!("クラスタリング: {}", self.cooperation.grouping);
        println!("近傍半径: {:.1} NM", self.cooperation.radius_nm);
        println!(
            "燃料係数: 単独 {} / 協調 {}",
            self.cooperation.alone_fuel_parameter, self.cooperation.coop_fuel_parameter
        );
        println!("接近判定距離: {:.0} m", self.cooperation.approached_distance_m);
        println!();

        println!("=== フライト ===");
        println!("フライト数: {}機", self.flights.len());
        for flight in &self.flights {
            match (flight.segments.first(), flight.segments.last()) {
                (Some(first), Some(last)) => println!(
                    "  {}: {}セグメント (t={}..{})",
                    flight.id,
                    flight.segments.len(),
                    first.time_init,
                    last.time_end
                ),
                _ => println!("  {}: セグメントなし", flight.id),
            }
        }
    }
}

impl ITrajectorySource for ScenarioConfig {
    fn flight_ids(&self) -> Vec<FlightId> {
        let mut ids: Vec<FlightId> = self.flights.iter().map(|f| f.id).collect();
        ids.sort_unstable();
        ids
    }

    fn load(&self, flight: FlightId) -> Result<Vec<TrajectorySegment>, TrajectoryError> {
        let config = self
            .flights
            .iter()
            .find(|f| f.id == flight)
            .ok_or(TrajectoryError::EmptyPlan(flight))?;

        let mut segments = config.segments.clone();
        if config.coordinates == CoordinateFormat::Minutes {
            for segment in &mut segments {
                segment.lat_init = geodesy::minutes_to_degrees(segment.lat_init);
                segment.lon_init = geodesy::minutes_to_degrees(segment.lon_init);
                segment.lat_end = geodesy::minutes_to_degrees(segment.lat_end);
                segment.lon_end = geodesy::minutes_to_degrees(segment.lon_end);
            }
        }
        segments.sort_by_key(|s| s.time_init);
        Ok(segments)
    }
}

/// シナリオ読み込みエラー
#[derive(Debug, Error)]
pub enum ScenarioError {
    #[error("シナリオファイルが見つかりません: {}", .0.display())]
    FileNotFound(PathBuf),
    #[error("ファイル読み込みエラー {}: {source}", .path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("YAML解析エラー {}: {source}", .path.display())]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_yaml::Error,
    },
    #[error("設定検証エラー: {0}")]
    Validation(String),
}
