use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::models::common::{
    constants::LEVEL_FLIGHT_STATUS,
    geodesy, FlightId, FlightStatus, GeoPosition,
};

/// 上昇完了とみなすために連続して必要な水平飛行セグメント数
const CLIMB_SETTLE_SEGMENTS: usize = 4;
/// 降下開始前に連続して必要な水平飛行セグメント数
const DESCENT_SETTLE_SEGMENTS: usize = 3;

/// 1タイムステップ分の飛行計画
///
/// 座標は10進度、フライトレベルは100ft単位、速度はノット、航跡は度です。
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrajectorySegment {
    pub time_init: i64,
    pub time_end: i64,
    pub lat_init: f64,
    pub lon_init: f64,
    pub lat_end: f64,
    pub lon_end: f64,
    pub level_init: i32,
    pub level_end: i32,
    pub ground_speed: f64,
    pub track: f64,
    pub status: u8,
    /// 消費燃料（kg）
    pub fuel: f64,
    /// セグメント長（NM）
    pub length: f64,
}

impl TrajectorySegment {
    pub fn init_position(&self) -> GeoPosition {
        GeoPosition::new(self.lat_init, self.lon_init)
    }

    pub fn end_position(&self) -> GeoPosition {
        GeoPosition::new(self.lat_end, self.lon_end)
    }

    /// 高度一定かつ水平飛行ステータスのセグメントか
    pub fn is_level_flight(&self) -> bool {
        self.level_init == self.level_end && self.status == LEVEL_FLIGHT_STATUS
    }

    /// 始点から終点までの測地線距離（NM）
    pub fn geodesic_length_nm(&self) -> f64 {
        geodesy::m_to_nm(self.init_position().distance_to(&self.end_position()))
    }
}

/// 降下開始点（Top of Descent）
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct TopOfDescent {
    pub position: GeoPosition,
    pub level: i32,
}

/// 軌道データのエラー
#[derive(Debug, Error)]
pub enum TrajectoryError {
    #[error("フライト {0} の飛行計画が空です")]
    EmptyPlan(FlightId),
    #[error("フライト {0} に巡航区間が見つかりません")]
    NoCruise(FlightId),
    #[error("フライト {0} の巡航後に降下セグメントがありません")]
    NoDescent(FlightId),
    #[error("フライト {0} の巡航距離が0のためKdを計算できません")]
    ZeroCruiseDistance(FlightId),
    #[error("フライト {flight} のセグメント {index} が存在しません")]
    MissingSegment { flight: FlightId, index: usize },
}

/// フライト1機分の飛行計画と、そこから一度だけ導出される時刻・定数
///
/// `planned` は読み込み時のまま保持し、`segments` はシミュレーション中に
/// 所有エージェントだけが書き換えます。
#[derive(Debug, Clone)]
pub struct FlightPlan {
    pub id: FlightId,
    pub planned: Vec<TrajectorySegment>,
    pub segments: Vec<TrajectorySegment>,
    pub init_time: i64,
    pub end_time: i64,
    pub cruise_time: i64,
    pub descent_time: i64,
    pub cruise_index: usize,
    pub descent_index: usize,
    pub top_of_descent: TopOfDescent,
    /// 巡航区間の燃料/距離定数（kg/NM）
    pub kd: f64,
}

impl FlightPlan {
    /// セグメント列から飛行計画を構築し、巡航・降下時刻とKdを導出します
    pub fn new(
        id: FlightId,
        segments: Vec<TrajectorySegment>,
        time_step: i64,
    ) -> Result<Self, TrajectoryError> {
        let (first, last) = match (segments.first(), segments.last()) {
            (Some(first), Some(last)) => (first, last),
            _ => return Err(TrajectoryError::EmptyPlan(id)),
        };
        let init_time = first.time_init;
        let end_time = last.time_end;

        let cruise_index = find_cruise_start(&segments).ok_or(TrajectoryError::NoCruise(id))?;
        let last_cruise = find_cruise_end(&segments).ok_or(TrajectoryError::NoCruise(id))?;
        let descent_index = last_cruise + 1;

        let cruise_time = init_time + (cruise_index as i64 + 1) * time_step;
        let descent_time = end_time - (segments.len() - descent_index) as i64 * time_step;

        // 最終巡航ステップでも次セグメントを書き換えられる必要がある
        let top_of_descent = segments
            .get(descent_index)
            .map(|seg| TopOfDescent {
                position: seg.init_position(),
                level: seg.level_init,
            })
            .ok_or(TrajectoryError::NoDescent(id))?;

        let kd = compute_kd(&segments[cruise_index..=descent_index])
            .ok_or(TrajectoryError::ZeroCruiseDistance(id))?;

        Ok(Self {
            id,
            planned: segments.clone(),
            segments,
            init_time,
            end_time,
            cruise_time,
            descent_time,
            cruise_index,
            descent_index,
            top_of_descent,
            kd,
        })
    }

    /// 時刻からライフサイクル状態を判定
    pub fn status_at(&self, curr_time: i64) -> FlightStatus {
        if self.init_time <= curr_time && curr_time < self.end_time {
            if curr_time >= self.cruise_time && curr_time < self.descent_time {
                FlightStatus::Cruise
            } else if curr_time < self.cruise_time {
                FlightStatus::Climb
            } else {
                FlightStatus::Descent
            }
        } else if curr_time < self.init_time {
            FlightStatus::NotStarted
        } else {
            FlightStatus::Finished
        }
    }

    pub fn segment(&self, index: usize) -> Result<&TrajectorySegment, TrajectoryError> {
        self.segments.get(index).ok_or(TrajectoryError::MissingSegment {
            flight: self.id,
            index,
        })
    }

    pub fn segment_mut(&mut self, index: usize) -> Result<&mut TrajectorySegment, TrajectoryError> {
        let flight = self.id;
        self.segments
            .get_mut(index)
            .ok_or(TrajectoryError::MissingSegment { flight, index })
    }

    /// 計画どおりの総燃料（kg）
    pub fn planned_fuel(&self) -> f64 {
        total_fuel(&self.planned)
    }

    /// シミュレーション後の総燃料（kg）
    pub fn simulated_fuel(&self) -> f64 {
        total_fuel(&self.segments)
    }

    pub fn is_modified(&self) -> bool {
        self.planned != self.segments
    }
}

fn total_fuel(segments: &[TrajectorySegment]) -> f64 {
    segments.iter().map(|s| s.fuel).sum()
}

/// 巡航区間の燃料と距離の比
fn compute_kd(cruise: &[TrajectorySegment]) -> Option<f64> {
    let fuel: f64 = cruise.iter().map(|s| s.fuel).sum();
    let distance: f64 = cruise.iter().map(|s| s.length).sum();
    if distance > 0.0 {
        Some(fuel / distance)
    } else {
        None
    }
}

/// 水平飛行が CLIMB_SETTLE_SEGMENTS 回続く最初の位置
fn find_cruise_start(segments: &[TrajectorySegment]) -> Option<usize> {
    segments
        .windows(CLIMB_SETTLE_SEGMENTS)
        .position(|w| w.iter().all(TrajectorySegment::is_level_flight))
}

/// 水平飛行が DESCENT_SETTLE_SEGMENTS 回続く最後の位置（窓の末尾）
fn find_cruise_end(segments: &[TrajectorySegment]) -> Option<usize> {
    segments
        .windows(DESCENT_SETTLE_SEGMENTS)
        .rposition(|w| w.iter().all(TrajectorySegment::is_level_flight))
        .map(|start| start + DESCENT_SETTLE_SEGMENTS - 1)
}
