mod comm;
mod logging;
mod models;
mod report;
mod scenario;
mod simulation;

use clap::{Arg, Command};
use logging::{init_logging, LogConfig};
use report::FileReportSink;
use scenario::ScenarioConfig;
use simulation::SimulationEngine;

fn main() {
    // コマンドライン引数の解析
    let matches = Command::new("coflsim")
        .version("0.1.0")
        .about("協調飛行シミュレーション (Cooperative Flying Simulation)")
        .long_about("航空機の協調飛行（編隊化）を評価するエージェントベースのシミュレーション\n\
                     Network Manager がクラスタを提案し、各フライトが交渉して合流します。")
        .arg(
            Arg::new("scenario")
                .short('s')
                .long("scenario")
                .value_name("FILE")
                .help("シナリオファイル(.yaml)のパスを指定")
                .long_help("実行するシナリオファイル(.yaml)のパスを指定します。\n\
                           飛行計画・協調パラメータ・出力先を含みます。")
        )
        .arg(
            Arg::new("info")
                .short('i')
                .long("info")
                .action(clap::ArgAction::SetTrue)
                .help("シナリオの情報のみ表示して終了")
        )
        .arg(
            Arg::new("verbose")
                .short('v')
                .long("verbose")
                .action(clap::ArgAction::Count)
                .help("詳細出力レベル (-v: DEBUG, -vv: TRACE)")
        )
        .arg(
            Arg::new("log-output")
                .long("log-output")
                .value_name("TARGET")
                .value_parser(["console", "file", "both"])
                .help("ログ出力先 (シナリオの log.output より優先)")
        )
        .get_matches();

    println!("協調飛行シミュレーション (Cooperative Flying Simulation) - coflsim v0.1.0");
    println!();

    let verbose_level = matches.get_count("verbose");

    if let Some(scenario_path) = matches.get_one::<String>("scenario") {
        let log_output = matches.get_one::<String>("log-output").map(String::as_str);
        match run_scenario(scenario_path, matches.get_flag("info"), verbose_level, log_output) {
            Ok(_) => {
                if verbose_level > 0 {
                    println!("シナリオ実行が正常に完了しました。");
                }
            }
            Err(e) => {
                eprintln!("エラー: {}", e);
                std::process::exit(1);
            }
        }
    } else {
        show_default_help();
    }
}

/// シナリオファイルを読み込んで実行
fn run_scenario(
    scenario_path: &str,
    info_only: bool,
    verbose_level: u8,
    log_output: Option<&str>,
) -> Result<(), Box<dyn std::error::Error>> {
    let scenario = ScenarioConfig::from_file(scenario_path)?;

    if info_only {
        scenario.print_summary();
        return Ok(());
    }

    let log_config = LogConfig::resolve(&scenario.log, verbose_level, log_output)?;
    // 非同期ファイル書き込みはガードが生きている間だけ有効
    let _guard = init_logging(log_config)?;

    execute_scenario(scenario)
}

/// シナリオの実行
fn execute_scenario(scenario: ScenarioConfig) -> Result<(), Box<dyn std::error::Error>> {
    scenario.print_summary();
    println!();

    let engine = SimulationEngine::new(&scenario)?;
    let mut sink = FileReportSink::create(&scenario.output.dir)?;

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_time()
        .build()?;
    let result = runtime.block_on(engine.run(&mut sink))?;

    let summary = &result.summary;
    println!("=== 結果 ===");
    println!(
        "クラスタ: 提案 {} / 実行 {} ({:.1}%)",
        summary.possible_clusters, summary.executed_clusters, summary.acceptance_ratio
    );
    println!(
        "燃料: 計画 {:.1} kg / 協調 {:.1} kg (差 {:.1} kg)",
        summary.total_original_fuel, summary.total_cooperative_fuel, summary.fuel_difference
    );
    println!("平均GRC: {:.4}", summary.grc_average);
    println!("出力先: {}", sink.dir().display());

    Ok(())
}

/// デフォルトヘルプとシナリオ一覧を表示
fn show_default_help() {
    println!("使用方法:");
    println!("  coflsim [オプション]");
    println!();
    println!("オプション:");
    println!("  -s, --scenario <FILE>     シナリオファイルを指定して実行");
    println!("  -i, --info                シナリオ情報のみ表示");
    println!("  -v, --verbose             詳細出力 (複数指定で詳細レベル上昇)");
    println!("      --log-output <TARGET> ログ出力先 (console, file, both)");
    println!("  -h, --help                このヘルプを表示");
    println!();
    println!("利用可能なシナリオファイル:");
    println!("  scenarios/line_abreast.yaml  - 並走する3機の基本シナリオ");
    println!("  scenarios/converging.yaml    - 異なる時刻に離陸する4機のシナリオ");
    println!();
    println!("例:");
    println!("  coflsim -s scenarios/line_abreast.yaml");
    println!("  coflsim -s scenarios/converging.yaml -vv --log-output both");
    println!("  coflsim -s scenarios/line_abreast.yaml -i");
}
