use std::collections::BTreeMap;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use tracing::trace;

use crate::comm::{CommError, Endpoint, Tag};
use crate::models::common::{geodesy, FlightId, GeoPosition};
use crate::models::trajectory::TrajectorySegment;

/// 群れ飛行モデル間で交換する自機の運動状態
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct FlockingState {
    pub track: f64,
    pub level: i32,
    pub ground_speed: f64,
}

impl FlockingState {
    pub fn from_segment(segment: &TrajectorySegment) -> Self {
        Self {
            track: segment.track,
            level: segment.level_init,
            ground_speed: segment.ground_speed,
        }
    }
}

/// 群れ飛行モデルが算出した次の位置
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct FlockingResult {
    pub position: GeoPosition,
    pub level: i32,
    pub track: f64,
    pub ground_speed: f64,
}

/// 群れ飛行モデル
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlockingModel {
    Vicsek,
}

impl FromStr for FlockingModel {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "vicsek" => Ok(FlockingModel::Vicsek),
            _ => Err(format!("未対応の群れ飛行モデル: {}. 利用可能: vicsek", s)),
        }
    }
}

impl FlockingModel {
    pub fn name(&self) -> &'static str {
        match self {
            FlockingModel::Vicsek => "vicsek",
        }
    }

    /// クラスタ内で運動状態を交換し、次の位置を求める
    pub async fn flock(
        &self,
        endpoint: &mut Endpoint,
        cluster: &[FlightId],
        current: &TrajectorySegment,
        time_step: i64,
    ) -> Result<FlockingResult, CommError> {
        let own = FlockingState::from_segment(current);
        let others: BTreeMap<FlightId, FlockingState> =
            endpoint.exchange(cluster, Tag::FlockingState, &own).await?;
        let result = match self {
            FlockingModel::Vicsek => vicsek(current, &others, cluster.len(), time_step),
        };
        trace!(
            "{} {} -> ({:.5}, {:.5}) FL{}",
            endpoint.role(),
            self.name(),
            result.position.lat,
            result.position.lon,
            result.level
        );
        Ok(result)
    }
}

/// ノイズなしのVicsekモデル
///
/// 新しい航跡は他機のみの平均、高度と速度は自機を含む全機の平均です。
/// 高度の平均は整数除算の後に10単位へ切り上げます。
pub fn vicsek(
    current: &TrajectorySegment,
    others: &BTreeMap<FlightId, FlockingState>,
    cluster_size: usize,
    time_step: i64,
) -> FlockingResult {
    let own = FlockingState::from_segment(current);
    let size = cluster_size.max(1);

    let track = if others.is_empty() || size < 2 {
        own.track
    } else {
        others.values().map(|s| s.track).sum::<f64>() / (size - 1) as f64
    };
    let level_sum = own.level + others.values().map(|s| s.level).sum::<i32>();
    let level = geodesy::round_up_to_ten((level_sum / size as i32) as f64);
    let ground_speed =
        (own.ground_speed + others.values().map(|s| s.ground_speed).sum::<f64>()) / size as f64;

    let distance_nm = ground_speed * time_step as f64 / 3600.0;
    let position = current
        .init_position()
        .project(track, geodesy::nm_to_m(distance_nm));

    FlockingResult {
        position,
        level,
        track,
        ground_speed,
    }
}

/// 接近判定: 全メンバーとの最大距離が `cluster_size × approached_distance` 以内
pub fn in_position<'a>(
    own: &GeoPosition,
    others: impl IntoIterator<Item = &'a GeoPosition>,
    cluster_size: usize,
    approached_distance_m: f64,
) -> bool {
    let max_separation = others
        .into_iter()
        .map(|other| own.distance_to(other))
        .fold(0.0_f64, f64::max);
    max_separation <= cluster_size as f64 * approached_distance_m
}

/// 燃料コスト比較の結果（kg）
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct FuelCheck {
    /// 単独で降下開始点へ直行する場合
    pub nominal: f64,
    /// 群れ位置を経由して降下開始点へ向かう場合
    pub cooperative: f64,
}

impl FuelCheck {
    pub fn passes(&self) -> bool {
        self.nominal >= self.cooperative
    }
}

/// 燃料係数
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct FuelFactors {
    pub kd: f64,
    pub alone: f64,
    pub coop: f64,
}

/// 現在位置 → 降下開始点 を単独飛行した場合と、
/// 現在位置 → 群れ位置（協調） → 降下開始点（単独）の燃料を比較
pub fn fuel_cost_check(
    current: &GeoPosition,
    next: &GeoPosition,
    top_of_descent: &GeoPosition,
    factors: FuelFactors,
) -> FuelCheck {
    let direct_nm = geodesy::m_to_nm(current.distance_to(top_of_descent));
    let formation_nm = geodesy::m_to_nm(current.distance_to(next));
    let onward_nm = geodesy::m_to_nm(next.distance_to(top_of_descent));

    FuelCheck {
        nominal: factors.kd * direct_nm * factors.alone,
        cooperative: factors.kd * formation_nm * factors.coop + factors.kd * onward_nm * factors.alone,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::trajectory::fixtures::straight_segments;

    fn segment(track: f64, level: i32, speed: f64) -> TrajectorySegment {
        let mut seg = straight_segments(0, GeoPosition::new(45.0, 0.0), track, speed, 0, 1, 0).remove(0);
        seg.level_init = level;
        seg.level_end = level;
        seg
    }

    fn state(track: f64, level: i32, ground_speed: f64) -> FlockingState {
        FlockingState {
            track,
            level,
            ground_speed,
        }
    }

    #[test]
    fn test_vicsek_heading_averages_other_members_only() {
        let own = segment(100.0, 350, 450.0);
        let mut others = BTreeMap::new();
        others.insert(2, state(10.0, 360, 420.0));
        others.insert(3, state(20.0, 340, 480.0));

        let result = vicsek(&own, &others, 3, 10);

        // 航跡: 他機2機の平均（自機の100度は含まない）
        assert!((result.track - 15.0).abs() < 1e-12);
        // 速度: 全3機の平均
        assert!((result.ground_speed - 450.0).abs() < 1e-12);
        // 高度: (350 + 360 + 340) / 3 = 350
        assert_eq!(result.level, 350);
    }

    #[test]
    fn test_vicsek_level_uses_integer_average_then_rounds_up() {
        let own = segment(0.0, 350, 450.0);
        let mut others = BTreeMap::new();
        others.insert(2, state(0.0, 361, 450.0));

        let result = vicsek(&own, &others, 2, 10);
        // (350 + 361) / 2 = 355 → 360
        assert_eq!(result.level, 360);
    }

    #[test]
    fn test_vicsek_displacement_matches_speed() {
        let own = segment(90.0, 350, 360.0);
        let mut others = BTreeMap::new();
        others.insert(2, state(90.0, 350, 360.0));

        let result = vicsek(&own, &others, 2, 10);
        // 360kt × 10s = 1NM
        let moved = own.init_position().distance_to(&result.position);
        assert!((moved - 1852.0).abs() < 0.01, "moved = {}", moved);
    }

    #[test]
    fn test_in_position_scales_with_cluster_size() {
        let own = GeoPosition::new(45.0, 0.0);
        let near = own.project(90.0, 900.0);
        let far = own.project(90.0, 1400.0);

        assert!(in_position(&own, [&near], 2, 500.0));
        assert!(!in_position(&own, [&near, &far], 2, 500.0));
        assert!(in_position(&own, [&near, &far], 3, 500.0));
        assert!(in_position(&own, std::iter::empty::<&GeoPosition>(), 1, 0.0));
    }

    #[test]
    fn test_fuel_check_favours_cooperation_on_direct_route() {
        let current = GeoPosition::new(45.0, 0.0);
        let tod = current.project(0.0, geodesy::nm_to_m(100.0));
        let next = current.project(0.0, geodesy::nm_to_m(1.0));
        let factors = FuelFactors {
            kd: 10.0,
            alone: 1.0,
            coop: 0.9,
        };

        let check = fuel_cost_check(&current, &next, &tod, factors);
        assert!(check.passes());
        assert!(check.nominal > check.cooperative);
    }

    #[test]
    fn test_fuel_check_monotonic_in_coop_parameter() {
        let current = GeoPosition::new(45.0, 0.0);
        let tod = current.project(0.0, geodesy::nm_to_m(100.0));
        // 側方へ大きく逸れる群れ位置
        let next = current.project(90.0, geodesy::nm_to_m(3.0));

        let mut previous = f64::MIN;
        for coop in [0.5, 0.7, 0.9, 1.0, 1.2] {
            let check = fuel_cost_check(
                &current,
                &next,
                &tod,
                FuelFactors {
                    kd: 10.0,
                    alone: 1.0,
                    coop,
                },
            );
            assert!(check.cooperative > previous);
            previous = check.cooperative;
        }
        let expensive = fuel_cost_check(
            &current,
            &next,
            &tod,
            FuelFactors {
                kd: 10.0,
                alone: 1.0,
                coop: 1.0,
            },
        );
        assert!(!expensive.passes());
    }

    #[test]
    fn test_model_from_str() {
        assert_eq!(FlockingModel::from_str("Vicsek"), Ok(FlockingModel::Vicsek));
        assert!(FlockingModel::from_str("boids").is_err());
    }
}
