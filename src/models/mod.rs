// 基本的なデータ型と測地計算
pub mod common;

// 供給元・出力先のインターフェース（trait）定義
pub mod traits;

// 飛行計画
pub mod trajectory;

// NM側: クラスタリングと中心性
pub mod clustering;
pub mod network;
pub mod network_manager;

// フライト側: 群れ飛行モデルと交渉
pub mod flocking;
pub mod negotiation;
pub mod flight;
