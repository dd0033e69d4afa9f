use geo::{Bearing, Destination, Distance, Geodesic, Point};
use serde::{Deserialize, Serialize};

/// フライト識別子（1..N、0は使用しない）
pub type FlightId = u32;

/// 地理座標（10進度）
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct GeoPosition {
    pub lat: f64, // deg
    pub lon: f64, // deg
}

impl GeoPosition {
    pub fn new(lat: f64, lon: f64) -> Self {
        Self { lat, lon }
    }

    /// 測地線距離（メートル）
    pub fn distance_to(&self, other: &GeoPosition) -> f64 {
        geodesy::distance(self.lat, self.lon, other.lat, other.lon)
    }

    /// 指定方位・距離だけ進んだ位置
    pub fn project(&self, bearing_deg: f64, distance_m: f64) -> GeoPosition {
        let (lat, lon) = geodesy::project(self.lat, self.lon, bearing_deg, distance_m);
        GeoPosition::new(lat, lon)
    }

    fn point(&self) -> Point<f64> {
        // geo の Point は (x=経度, y=緯度)
        Point::new(self.lon, self.lat)
    }
}

/// フライトのライフサイクル状態
///
/// 順序は厳密に NotStarted → Climb → Cruise → Descent → Finished で、
/// 後戻りはしません。
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum FlightStatus {
    NotStarted,
    Climb,
    Cruise,
    Descent,
    Finished,
}

impl FlightStatus {
    /// 時刻の進行対象（飛行中）かどうか
    pub fn is_airborne(&self) -> bool {
        matches!(self, FlightStatus::Climb | FlightStatus::Cruise | FlightStatus::Descent)
    }
}

impl std::fmt::Display for FlightStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            FlightStatus::NotStarted => "NOT_STARTED",
            FlightStatus::Climb => "CLIMB",
            FlightStatus::Cruise => "CRUISE",
            FlightStatus::Descent => "DESCENT",
            FlightStatus::Finished => "FINISHED",
        };
        f.write_str(s)
    }
}

/// シミュレーション時計
///
/// 全フライトの最早離陸時刻から最遅着陸時刻までを `time_step` 刻みで進みます。
/// 終了時刻のティックも含みます。
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SimulationClock {
    pub init_time: i64,
    pub end_time: i64,
    pub time_step: i64,
}

impl SimulationClock {
    /// 各フライトの (離陸, 着陸) 時刻から時計を作成（フライトがなければ None）
    pub fn from_spans(spans: impl IntoIterator<Item = (i64, i64)>, time_step: i64) -> Option<Self> {
        spans
            .into_iter()
            .fold(None, |acc: Option<(i64, i64)>, (init, end)| match acc {
                Some((lo, hi)) => Some((lo.min(init), hi.max(end))),
                None => Some((init, end)),
            })
            .map(|(init_time, end_time)| Self {
                init_time,
                end_time,
                time_step,
            })
    }

    /// `init_time ..= end_time` のティック列
    pub fn ticks(&self) -> impl Iterator<Item = i64> + use<> {
        let step = self.time_step.max(1) as usize;
        (self.init_time..=self.end_time).step_by(step)
    }

    pub fn tick_count(&self) -> usize {
        self.ticks().count()
    }
}

/// シミュレーション定数
pub mod constants {
    /// デフォルトの時間刻み（秒）
    pub const TIME_STEP_S: i64 = 10;
    pub const KT_TO_M: f64 = 0.514444;
    pub const M_TO_NM: f64 = 0.000539957;
    pub const NM_TO_M: f64 = 1852.0;
    /// 同一方向とみなす航跡差（度）
    pub const TRACKS_DIFFERENCE_DEG: f64 = 15.0;
    /// 水平飛行セグメントのステータスコード
    pub const LEVEL_FLIGHT_STATUS: u8 = 2;
}

/// 測地計算ユーティリティ
///
/// WGS84楕円体上の測地線（Karneyのアルゴリズム）で距離・方位・前方投影を計算します。
/// 不正な座標はプログラミングエラーとして扱い、ここでは検証しません。
pub mod geodesy {
    use super::*;
    use super::constants::{M_TO_NM, NM_TO_M};

    /// 2点間の測地線距離（メートル）
    pub fn distance(lat_a: f64, lon_a: f64, lat_b: f64, lon_b: f64) -> f64 {
        Geodesic::distance(
            GeoPosition::new(lat_a, lon_a).point(),
            GeoPosition::new(lat_b, lon_b).point(),
        )
    }

    /// 2点間の初期方位（度、0〜360、北=0 時計回り）
    pub fn bearing(lat_a: f64, lon_a: f64, lat_b: f64, lon_b: f64) -> f64 {
        let azimuth = Geodesic::bearing(
            GeoPosition::new(lat_a, lon_a).point(),
            GeoPosition::new(lat_b, lon_b).point(),
        );
        azimuth.rem_euclid(360.0)
    }

    /// 方位と距離（メートル）から到達点（緯度, 経度）を求める
    pub fn project(lat: f64, lon: f64, bearing_deg: f64, distance_m: f64) -> (f64, f64) {
        let destination = Geodesic::destination(
            GeoPosition::new(lat, lon).point(),
            bearing_deg,
            distance_m,
        );
        (destination.y(), destination.x())
    }

    /// 航跡が一致するか（|t1 - t2| <= threshold、周回補正なし）
    pub fn tracks_match(track_a: f64, track_b: f64, threshold_deg: f64) -> bool {
        (track_a - track_b).abs() <= threshold_deg
    }

    pub fn m_to_nm(meters: f64) -> f64 {
        meters * M_TO_NM
    }

    pub fn nm_to_m(nautical_miles: f64) -> f64 {
        nautical_miles * NM_TO_M
    }

    /// 10単位での切り上げ（フライトレベル用）
    pub fn round_up_to_ten(x: f64) -> i32 {
        ((x / 10.0).ceil() * 10.0) as i32
    }

    /// 10進分（eSO6形式）を度に変換
    pub fn minutes_to_degrees(minutes: f64) -> f64 {
        minutes / 60.0
    }
}

#[cfg(test)]
mod tests {
    use super::geodesy::*;
    use super::*;

    #[test]
    fn test_distance_one_degree_latitude() {
        // 赤道付近の緯度1度はおよそ110.57km
        let d = distance(0.0, 0.0, 1.0, 0.0);
        assert!((d - 110_574.0).abs() < 5.0, "distance = {}", d);
    }

    #[test]
    fn test_project_and_distance_agree() {
        let origin = GeoPosition::new(40.0, -3.0);
        let target = origin.project(45.0, 25_000.0);
        assert!((origin.distance_to(&target) - 25_000.0).abs() < 0.01);

        let b = bearing(origin.lat, origin.lon, target.lat, target.lon);
        assert!((b - 45.0).abs() < 1e-6, "bearing = {}", b);
    }

    #[test]
    fn test_project_north_keeps_longitude() {
        let (lat, lon) = project(10.0, 20.0, 0.0, nm_to_m(5.0));
        assert!(lat > 10.0);
        assert!((lon - 20.0).abs() < 1e-9);
    }

    #[test]
    fn test_tracks_match_without_wraparound() {
        assert!(tracks_match(10.0, 25.0, 15.0));
        assert!(!tracks_match(10.0, 25.1, 15.0));
        // 359度と1度は実際には近いが、差の絶対値のみで判定する
        assert!(!tracks_match(359.0, 1.0, 15.0));
    }

    #[test]
    fn test_unit_conversions() {
        assert_eq!(nm_to_m(1.0), 1852.0);
        assert!((m_to_nm(1852.0) - 1.0).abs() < 1e-4);
        assert_eq!(minutes_to_degrees(2430.0), 40.5);
    }

    #[test]
    fn test_round_up_to_ten() {
        assert_eq!(round_up_to_ten(351.0), 360);
        assert_eq!(round_up_to_ten(350.0), 350);
        assert_eq!(round_up_to_ten(0.0), 0);
    }

    #[test]
    fn test_status_order_is_lifecycle_order() {
        assert!(FlightStatus::NotStarted < FlightStatus::Climb);
        assert!(FlightStatus::Climb < FlightStatus::Cruise);
        assert!(FlightStatus::Cruise < FlightStatus::Descent);
        assert!(FlightStatus::Descent < FlightStatus::Finished);
        assert_eq!(FlightStatus::Cruise.to_string(), "CRUISE");
        assert!(!FlightStatus::Finished.is_airborne());
    }

    #[test]
    fn test_clock_spans_all_flights_inclusive() {
        let clock = SimulationClock::from_spans([(100, 200), (50, 150), (120, 260)], 10).unwrap();
        assert_eq!(clock.init_time, 50);
        assert_eq!(clock.end_time, 260);
        let ticks: Vec<i64> = clock.ticks().collect();
        assert_eq!(ticks.first(), Some(&50));
        assert_eq!(ticks.last(), Some(&260));
        assert_eq!(clock.tick_count(), 22);
        assert!(SimulationClock::from_spans(std::iter::empty(), 10).is_none());
    }
}
