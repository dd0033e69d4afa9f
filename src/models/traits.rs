use crate::models::common::FlightId;
use crate::models::trajectory::{TrajectoryError, TrajectorySegment};
use crate::report::{ReportError, ResultsRow, SimulationSummary};

/// 飛行計画の供給元
///
/// 起動時に一度だけ読み込まれ、以後は各フライトエージェントが自分の
/// コピーを書き換えます。
pub trait ITrajectorySource {
    /// 計画を持つフライトID（昇順）
    fn flight_ids(&self) -> Vec<FlightId>;

    /// フライトの時刻順セグメント
    fn load(&self, flight: FlightId) -> Result<Vec<TrajectorySegment>, TrajectoryError>;
}

/// 集計結果の出力先
pub trait IReportSink {
    /// タイムステップごとの結果行
    fn write_results_row(&mut self, row: &ResultsRow) -> Result<(), ReportError>;

    /// シミュレーション終了時の集計
    fn write_summary(&mut self, summary: &SimulationSummary) -> Result<(), ReportError>;
}
