//! # Report モジュール
//!
//! シミュレーション結果の集計と出力を提供します。
//!
//! - `results.txt`: タイムステップごとの巡航機数・クラスタ数・GRC
//! - `summary.txt`: 実行条件と全体集計（項目順は固定）
//! - `cooperativeFlights.txt`: フライトごとの協調飛行相手

use std::collections::BTreeMap;
use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::info;

use crate::comm::MessageStats;
use crate::models::common::FlightId;
use crate::models::network_manager::CoordinatorReport;
use crate::models::traits::IReportSink;

pub const RESULTS_FILE: &str = "results.txt";
pub const SUMMARY_FILE: &str = "summary.txt";
pub const COOPERATIVE_FLIGHTS_FILE: &str = "cooperativeFlights.txt";

const RESULTS_BANNER: &str = "Current_time qOfCruiseFlights nmQOfClusters qOfClusters GRC";
const COOPERATIVE_FLIGHTS_BANNER: &str = "Flight Cooperative_flights";
const SEPARATOR: &str = "---------------------------------------------------------------------------";

/// レポート出力エラー
#[derive(Debug, Error)]
pub enum ReportError {
    #[error("レポートファイル {path} への書き込みに失敗しました: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// タイムステップごとの結果（クラスタ数は累計）
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResultsRow {
    pub time: i64,
    pub cruise_flights: usize,
    pub possible_clusters: u64,
    pub executed_clusters: u64,
    pub grc: f64,
}

impl ResultsRow {
    pub fn to_line(&self) -> String {
        format!(
            "{} {} {} {} {}",
            self.time, self.cruise_flights, self.possible_clusters, self.executed_clusters, self.grc
        )
    }
}

/// 合計・平均・最大・最小（空なら全て0）
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct Aggregate {
    pub total: f64,
    pub average: f64,
    pub max: f64,
    pub min: f64,
}

impl Aggregate {
    pub fn from_values(values: &[f64]) -> Self {
        if values.is_empty() {
            return Self::default();
        }
        let total: f64 = values.iter().sum();
        Self {
            total,
            average: total / values.len() as f64,
            max: values.iter().copied().fold(f64::MIN, f64::max),
            min: values.iter().copied().fold(f64::MAX, f64::min),
        }
    }
}

/// 通信量6項目それぞれの集計
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct TrafficAggregate {
    pub bytes_sent: Aggregate,
    pub bytes_received: Aggregate,
    pub sending_time: Aggregate,
    pub receiving_time: Aggregate,
    pub msgs_sent: Aggregate,
    pub msgs_received: Aggregate,
}

impl TrafficAggregate {
    pub fn from_stats<'a>(stats: impl IntoIterator<Item = &'a MessageStats>) -> Self {
        let stats: Vec<&MessageStats> = stats.into_iter().collect();
        let of = |f: fn(&MessageStats) -> f64| -> Aggregate {
            Aggregate::from_values(&stats.iter().map(|s| f(s)).collect::<Vec<_>>())
        };
        Self {
            bytes_sent: of(|s| s.bytes_sent as f64),
            bytes_received: of(|s| s.bytes_received as f64),
            sending_time: of(|s| s.sending_time),
            receiving_time: of(|s| s.receiving_time),
            msgs_sent: of(|s| s.msgs_sent as f64),
            msgs_received: of(|s| s.msgs_received as f64),
        }
    }
}

/// 実行条件
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunInfo {
    pub test_case_id: String,
    pub scenario: String,
    pub aircraft: usize,
    pub machines: Vec<String>,
    pub model: String,
    pub grouping: String,
    pub radius_nm: f64,
    pub alone_fuel_parameter: f64,
    pub coop_fuel_parameter: f64,
    pub approached_distance_m: f64,
}

/// シミュレーション全体の集計
///
/// フィールド順は `summary.txt` の行順と一致します。
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SimulationSummary {
    pub info: RunInfo,
    /// NM + フライト数
    pub processes: usize,
    pub executed_clusters: u64,
    pub possible_clusters: u64,
    /// 実行クラスタ / 提案クラスタ（%）
    pub acceptance_ratio: f64,
    pub grc_average: f64,
    pub grc_max: f64,
    pub grc_min: f64,
    pub grc_updates: u64,
    pub total_original_fuel: f64,
    pub total_cooperative_fuel: f64,
    pub fuel_difference: f64,
    pub flights_with_savings: Vec<FlightId>,
    pub flights_without_savings: Vec<FlightId>,
    /// クラスタに1回以上参加したフライトのみ
    pub clusters_per_aircraft: Aggregate,
    pub clustered_duration_s: Aggregate,
    /// NMを含む全参加者
    pub overall: TrafficAggregate,
    /// クラスタに1回以上参加したフライトのフライト間通信
    pub clustered: TrafficAggregate,
    pub flown_with: BTreeMap<FlightId, Vec<FlightId>>,
    pub results: Vec<ResultsRow>,
}

impl SimulationSummary {
    pub fn build(info: RunInfo, report: &CoordinatorReport) -> Self {
        let flights = &report.flights;

        let acceptance_ratio = if report.possible_clusters >= 1 {
            (report.executed_clusters * 100) as f64 / report.possible_clusters as f64
        } else {
            0.0
        };

        let total_original_fuel: f64 = flights.values().map(|f| f.original_fuel).sum();
        let total_cooperative_fuel: f64 = flights.values().map(|f| f.cooperative_fuel).sum();
        let flights_with_savings = flights
            .iter()
            .filter(|(_, f)| f.original_fuel > f.cooperative_fuel)
            .map(|(id, _)| *id)
            .collect();
        let flights_without_savings = flights
            .iter()
            .filter(|(_, f)| f.original_fuel < f.cooperative_fuel)
            .map(|(id, _)| *id)
            .collect();

        let cooperative: Vec<_> = flights.values().filter(|f| f.clusters_joined > 0).collect();
        let clusters_per_aircraft = Aggregate::from_values(
            &cooperative.iter().map(|f| f.clusters_joined as f64).collect::<Vec<_>>(),
        );
        let clustered_duration_s = Aggregate::from_values(
            &cooperative
                .iter()
                .map(|f| f.clustered_duration_s as f64)
                .collect::<Vec<_>>(),
        );

        let overall = TrafficAggregate::from_stats(
            flights
                .values()
                .map(|f| &f.traffic.overall)
                .chain(std::iter::once(&report.traffic.overall)),
        );
        let clustered = TrafficAggregate::from_stats(cooperative.iter().map(|f| &f.traffic.clustered));

        Self {
            processes: info.aircraft + 1,
            info,
            executed_clusters: report.executed_clusters,
            possible_clusters: report.possible_clusters,
            acceptance_ratio,
            grc_average: report.grc.average(),
            grc_max: report.grc.max,
            grc_min: report.grc.min,
            grc_updates: report.grc.updates,
            total_original_fuel,
            total_cooperative_fuel,
            fuel_difference: total_original_fuel - total_cooperative_fuel,
            flights_with_savings,
            flights_without_savings,
            clusters_per_aircraft,
            clustered_duration_s,
            overall,
            clustered,
            flown_with: flights
                .iter()
                .map(|(id, f)| (*id, f.flown_with.clone()))
                .collect(),
            results: report.results.clone(),
        }
    }

    /// `summary.txt` の本文（ラベル: 値）
    pub fn lines(&self) -> Vec<String> {
        let mut lines = Vec::new();
        let mut push = |label: &str, value: String| lines.push(format!("{}: {}", label, value));

        push("Test case ID", self.info.test_case_id.clone());
        push("Scenario", self.info.scenario.clone());
        push("Quantity of aircraft", self.info.aircraft.to_string());
        push("Processes", self.processes.to_string());
        push("Quantity of machines", self.info.machines.len().to_string());
        push("Machines", format!("{:?}", self.info.machines));
        push("Cooperatively flying model", self.info.model.clone());
        push("Clustering model", self.info.grouping.clone());
        push("Neighbouring radius [NM]", self.info.radius_nm.to_string());
        push("Parameter for flying solo", self.info.alone_fuel_parameter.to_string());
        push("Parameter for flying cooperatively", self.info.coop_fuel_parameter.to_string());
        push("Joined distance [m]", self.info.approached_distance_m.to_string());
        push("Total quantity of executed clusters", self.executed_clusters.to_string());
        push("Total quantity of possible clusters", self.possible_clusters.to_string());
        push("Cluster acceptance ratio", self.acceptance_ratio.to_string());
        push("Average GRC", self.grc_average.to_string());
        push("Max GRC", self.grc_max.to_string());
        push("Min GRC", self.grc_min.to_string());
        push("GRC updates", self.grc_updates.to_string());
        push("Total fuel in original trajectory [Kg]", self.total_original_fuel.to_string());
        push("Total fuel in cooperative trajectory [Kg]", self.total_cooperative_fuel.to_string());
        push("Difference in fuel [Kg]", self.fuel_difference.to_string());
        push("Quantity of flights with fuel savings", self.flights_with_savings.len().to_string());
        push("Flights with fuel savings", format!("{:?}", self.flights_with_savings));
        push("Quantity of flights without fuel savings", self.flights_without_savings.len().to_string());
        push("Flights without fuel savings", format!("{:?}", self.flights_without_savings));
        push("Average quantity of clusters", self.clusters_per_aircraft.average.to_string());
        push("Maximum quantity of clusters", self.clusters_per_aircraft.max.to_string());
        push("Minimum quantity of clusters", self.clusters_per_aircraft.min.to_string());
        push("Average clustered time duration [s]", self.clustered_duration_s.average.to_string());
        push("Maximum clustered time duration [s]", self.clustered_duration_s.max.to_string());
        push("Minimum clustered time duration [s]", self.clustered_duration_s.min.to_string());
        traffic_lines(&mut push, &self.overall, "");
        traffic_lines(&mut push, &self.clustered, " within clustered flights");
        lines
    }
}

fn traffic_lines(push: &mut impl FnMut(&str, String), traffic: &TrafficAggregate, scope: &str) {
    let quantities = [
        ("bytes sent via msgs", " [bytes]", &traffic.bytes_sent),
        ("bytes received via msgs", " [bytes]", &traffic.bytes_received),
        ("time sending msgs", " [s]", &traffic.sending_time),
        ("time receiving msgs", " [s]", &traffic.receiving_time),
        ("quantity of msgs sent", "", &traffic.msgs_sent),
        ("quantity of msgs received", "", &traffic.msgs_received),
    ];
    for (name, unit, agg) in quantities {
        push(&format!("Total {}{}{}", name, scope, unit), agg.total.to_string());
        push(&format!("Average {}{}{}", name, scope, unit), agg.average.to_string());
        push(&format!("Maximum {}{}{}", name, scope, unit), agg.max.to_string());
        push(&format!("Minimum {}{}{}", name, scope, unit), agg.min.to_string());
    }
}

/// 出力ディレクトリへファイルとして書き出すシンク
#[derive(Debug)]
pub struct FileReportSink {
    dir: PathBuf,
}

impl FileReportSink {
    /// ディレクトリを作成し、`results.txt` をヘッダー付きで初期化
    pub fn create<P: AsRef<Path>>(dir: P) -> Result<Self, ReportError> {
        let dir = dir.as_ref().to_path_buf();
        fs::create_dir_all(&dir).map_err(|source| ReportError::Io {
            path: dir.clone(),
            source,
        })?;
        let sink = Self { dir };
        sink.write_file(RESULTS_FILE, &[RESULTS_BANNER.to_string()])?;
        Ok(sink)
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn write_file(&self, name: &str, lines: &[String]) -> Result<(), ReportError> {
        let path = self.dir.join(name);
        let mut body = lines.join("\n");
        body.push('\n');
        fs::write(&path, body).map_err(|source| ReportError::Io { path, source })
    }
}

impl IReportSink for FileReportSink {
    fn write_results_row(&mut self, row: &ResultsRow) -> Result<(), ReportError> {
        let path = self.dir.join(RESULTS_FILE);
        let mut file = OpenOptions::new()
            .append(true)
            .create(true)
            .open(&path)
            .map_err(|source| ReportError::Io {
                path: path.clone(),
                source,
            })?;
        writeln!(file, "{}", row.to_line()).map_err(|source| ReportError::Io { path, source })
    }

    fn write_summary(&mut self, summary: &SimulationSummary) -> Result<(), ReportError> {
        let mut lines = vec![SEPARATOR.to_string(), "Cooperative flights simulation".to_string(), SEPARATOR.to_string()];
        lines.extend(summary.lines());
        self.write_file(SUMMARY_FILE, &lines)?;

        let mut cooperative = vec![COOPERATIVE_FLIGHTS_BANNER.to_string()];
        cooperative.extend(summary.flown_with.iter().map(|(flight, others)| {
            let others: Vec<String> = others.iter().map(|id| id.to_string()).collect();
            format!("{} {}", flight, others.join(","))
        }));
        self.write_file(COOPERATIVE_FLIGHTS_FILE, &cooperative)?;

        info!("レポートを出力しました: {}", self.dir.display());
        Ok(())
    }
}

/// メモリ上に保持するシンク
#[derive(Debug, Default)]
pub struct MemoryReportSink {
    pub rows: Vec<ResultsRow>,
    pub summary: Option<SimulationSummary>,
}

impl IReportSink for MemoryReportSink {
    fn write_results_row(&mut self, row: &ResultsRow) -> Result<(), ReportError> {
        self.rows.push(row.clone());
        Ok(())
    }

    fn write_summary(&mut self, summary: &SimulationSummary) -> Result<(), ReportError> {
        self.summary = Some(summary.clone());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::comm::TrafficStats;
    use crate::models::clustering::ClusterMap;
    use crate::models::flight::FlightSummary;
    use crate::models::network::GrcStats;

    fn flight(original: f64, cooperative: f64, clusters: u32, bytes: u64, flown_with: Vec<FlightId>) -> FlightSummary {
        let mut traffic = TrafficStats::default();
        traffic.overall.bytes_sent = bytes;
        traffic.clustered.bytes_sent = bytes / 2;
        FlightSummary {
            original_fuel: original,
            cooperative_fuel: cooperative,
            clusters_joined: clusters,
            clustered_duration_s: clusters as i64 * 30,
            flown_with,
            traffic,
        }
    }

    fn run_info() -> RunInfo {
        RunInfo {
            test_case_id: "tc_001".to_string(),
            scenario: "two_flights".to_string(),
            aircraft: 3,
            machines: vec!["localhost".to_string()],
            model: "vicsek".to_string(),
            grouping: "fifo".to_string(),
            radius_nm: 10.0,
            alone_fuel_parameter: 1.0,
            coop_fuel_parameter: 0.9,
            approached_distance_m: 500.0,
        }
    }

    fn coordinator_report() -> CoordinatorReport {
        let mut grc = GrcStats::default();
        grc.record(0.5);
        grc.record(0.0);
        let mut traffic = TrafficStats::default();
        traffic.overall.bytes_sent = 40;
        CoordinatorReport {
            possible_clusters: 4,
            executed_clusters: 3,
            grc,
            results: vec![ResultsRow {
                time: 100,
                cruise_flights: 2,
                possible_clusters: 1,
                executed_clusters: 1,
                grc: 0.0,
            }],
            flights: BTreeMap::from([
                (1, flight(100.0, 90.0, 2, 100, vec![2])),
                (2, flight(100.0, 95.0, 1, 60, vec![1])),
                (3, flight(100.0, 100.0, 0, 20, vec![])),
            ]),
            traffic,
            final_clusters: ClusterMap::new([1, 2, 3]),
        }
    }

    #[test]
    fn test_summary_aggregates() {
        let summary = SimulationSummary::build(run_info(), &coordinator_report());

        assert_eq!(summary.processes, 4);
        assert_eq!(summary.acceptance_ratio, 75.0);
        assert_eq!(summary.grc_average, 0.25);
        assert_eq!(summary.total_original_fuel, 300.0);
        assert_eq!(summary.fuel_difference, 15.0);
        assert_eq!(summary.flights_with_savings, vec![1, 2]);
        assert!(summary.flights_without_savings.is_empty());
        assert_eq!(summary.clusters_per_aircraft.average, 1.5);
        assert_eq!(summary.clustered_duration_s.max, 60.0);
        // 全体通信はNMを含む4参加者
        assert_eq!(summary.overall.bytes_sent.total, 220.0);
        assert_eq!(summary.overall.bytes_sent.average, 55.0);
        assert_eq!(summary.overall.bytes_sent.min, 20.0);
        // クラスタ内通信はクラスタ経験のある2機のみ
        assert_eq!(summary.clustered.bytes_sent.total, 80.0);
        assert_eq!(summary.clustered.bytes_sent.min, 30.0);
    }

    #[test]
    fn test_summary_line_order() {
        let summary = SimulationSummary::build(run_info(), &coordinator_report());
        let lines = summary.lines();

        let labels: Vec<&str> = lines.iter().filter_map(|l| l.split(": ").next()).collect();
        assert_eq!(labels[0], "Test case ID");
        assert_eq!(labels[2], "Quantity of aircraft");
        assert_eq!(labels[3], "Processes");
        assert_eq!(labels[12], "Total quantity of executed clusters");
        assert_eq!(labels[14], "Cluster acceptance ratio");
        assert_eq!(labels[18], "GRC updates");
        assert_eq!(labels[31], "Minimum clustered time duration [s]");
        assert_eq!(labels[32], "Total bytes sent via msgs [bytes]");
        assert_eq!(labels[56], "Total bytes sent via msgs within clustered flights [bytes]");
        assert_eq!(lines.len(), 80);
    }

    #[test]
    fn test_zero_possible_clusters_gives_zero_ratio() {
        let mut report = coordinator_report();
        report.possible_clusters = 0;
        report.executed_clusters = 0;
        let summary = SimulationSummary::build(run_info(), &report);
        assert_eq!(summary.acceptance_ratio, 0.0);
    }

    #[test]
    fn test_file_sink_writes_three_files() {
        let dir = tempfile::tempdir().unwrap();
        let out = dir.path().join("out");
        let mut sink = FileReportSink::create(&out).unwrap();
        let summary = SimulationSummary::build(run_info(), &coordinator_report());

        for row in &summary.results {
            sink.write_results_row(row).unwrap();
        }
        sink.write_summary(&summary).unwrap();

        let results = fs::read_to_string(out.join(RESULTS_FILE)).unwrap();
        assert_eq!(results, format!("{}\n100 2 1 1 0\n", RESULTS_BANNER));

        let cooperative = fs::read_to_string(out.join(COOPERATIVE_FLIGHTS_FILE)).unwrap();
        assert_eq!(cooperative, "Flight Cooperative_flights\n1 2\n2 1\n3 \n");

        let text = fs::read_to_string(out.join(SUMMARY_FILE)).unwrap();
        assert!(text.contains("Test case ID: tc_001\n"));
        assert!(text.contains("Cluster acceptance ratio: 75\n"));
    }

    #[test]
    fn test_memory_sink_keeps_rows_and_summary() {
        let mut sink = MemoryReportSink::default();
        let summary = SimulationSummary::build(run_info(), &coordinator_report());
        sink.write_results_row(&summary.results[0]).unwrap();
        sink.write_summary(&summary).unwrap();
        assert_eq!(sink.rows.len(), 1);
        assert_eq!(sink.summary, Some(summary));
    }
}
