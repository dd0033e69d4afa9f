use std::collections::{BTreeMap, BTreeSet};
use std::str::FromStr;

use tracing::trace;

use crate::models::common::{
    constants::TRACKS_DIFFERENCE_DEG,
    geodesy, FlightId,
};
use crate::models::trajectory::TrajectorySegment;

/// フライトごとの所属クラスタ
///
/// 空集合は単独飛行、非空集合は自分を含むクラスタ全員です。
/// 対称性（BがAの集合に含まれる ⇔ AがBの集合に含まれる）は
/// 編集のたびに明示的に再構築する必要があります。
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ClusterMap {
    clusters: BTreeMap<FlightId, BTreeSet<FlightId>>,
}

impl ClusterMap {
    /// 全フライトを空クラスタで登録
    pub fn new(flights: impl IntoIterator<Item = FlightId>) -> Self {
        Self {
            clusters: flights.into_iter().map(|id| (id, BTreeSet::new())).collect(),
        }
    }

    pub fn get(&self, flight: FlightId) -> Option<&BTreeSet<FlightId>> {
        self.clusters.get(&flight)
    }

    /// 所属メンバー（昇順、未登録なら空）
    pub fn members(&self, flight: FlightId) -> Vec<FlightId> {
        self.clusters
            .get(&flight)
            .map(|set| set.iter().copied().collect())
            .unwrap_or_default()
    }

    pub fn is_clustered(&self, flight: FlightId) -> bool {
        self.clusters.get(&flight).is_some_and(|set| !set.is_empty())
    }

    /// 非空クラスタに属するフライト
    pub fn clustered_flights(&self) -> BTreeSet<FlightId> {
        self.clusters
            .iter()
            .filter(|(_, set)| !set.is_empty())
            .map(|(id, _)| *id)
            .collect()
    }

    pub fn has_clusters(&self) -> bool {
        self.clusters.values().any(|set| !set.is_empty())
    }

    pub fn iter(&self) -> impl Iterator<Item = (&FlightId, &BTreeSet<FlightId>)> {
        self.clusters.iter()
    }

    /// 2機のクラスタを結合し、結合後の全員に同じ集合を割り当てる
    pub fn merge(&mut self, a: FlightId, b: FlightId) {
        let mut union: BTreeSet<FlightId> = [a, b].into_iter().collect();
        for id in [a, b] {
            if let Some(set) = self.clusters.get(&id) {
                union.extend(set.iter().copied());
            }
        }
        for id in &union {
            self.clusters.insert(*id, union.clone());
        }
    }

    /// フライトを全クラスタから除外（自分の集合も空にする）
    pub fn evict(&mut self, flight: FlightId) {
        if let Some(set) = self.clusters.get_mut(&flight) {
            set.clear();
        }
        for set in self.clusters.values_mut() {
            set.remove(&flight);
        }
    }

    /// 各フライトAの集合を、Aの集合に含まれる全員へ複写する
    pub fn propagate(&mut self) {
        let ids: Vec<FlightId> = self.clusters.keys().copied().collect();
        for id in ids {
            let set = match self.clusters.get(&id) {
                Some(set) if !set.is_empty() => set.clone(),
                _ => continue,
            };
            for other in set.iter().filter(|other| **other != id) {
                self.clusters.insert(*other, set.clone());
            }
        }
    }

    /// B ∈ cluster(A) ⇔ A ∈ cluster(B)
    pub fn is_symmetric(&self) -> bool {
        self.clusters.iter().all(|(a, set)| {
            set.iter()
                .filter(|b| *b != a)
                .all(|b| self.clusters.get(b).is_some_and(|other| other.contains(a)))
        })
    }

    /// 非空クラスタが互いに素な分割になっているか
    pub fn is_partition(&self) -> bool {
        self.clusters.iter().all(|(a, set)| {
            set.is_empty()
                || (set.contains(a)
                    && set
                        .iter()
                        .all(|b| self.clusters.get(b).is_some_and(|other| other == set)))
        })
    }

    /// 前回空だったフライトが新たにクラスタを持った数（グループ単位）
    pub fn count_new_clusters(&self, previous: &ClusterMap) -> usize {
        let mut checked = BTreeSet::new();
        let mut count = 0;
        for (id, set) in &self.clusters {
            let was_empty = previous.get(*id).is_none_or(|p| p.is_empty());
            if was_empty && !set.is_empty() && !checked.contains(id) {
                count += 1;
                checked.extend(set.iter().copied());
            }
        }
        count
    }

    /// 1行表記（ログ用） 例: "1:[1, 2] 2:[1, 2] 3:[]"
    pub fn describe(&self) -> String {
        self.clusters
            .iter()
            .map(|(id, set)| format!("{}:{:?}", id, set.iter().collect::<Vec<_>>()))
            .collect::<Vec<_>>()
            .join(" ")
    }
}

/// クラスタリング結果
#[derive(Debug, Clone)]
pub struct ClusteringOutcome {
    pub clusters: ClusterMap,
    pub clustered: BTreeSet<FlightId>,
    /// 非空クラスタが1つでもあるか
    pub has_clusters: bool,
    /// 入力のクラスタマップから変化したか
    pub changed: bool,
}

/// クラスタリング（グルーピング）モデル
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GroupingModel {
    Fifo,
}

impl FromStr for GroupingModel {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "fifo" => Ok(GroupingModel::Fifo),
            _ => Err(format!("未対応のクラスタリングモデル: {}. 利用可能: fifo", s)),
        }
    }
}

impl GroupingModel {
    pub fn name(&self) -> &'static str {
        match self {
            GroupingModel::Fifo => "fifo",
        }
    }

    pub fn propose(
        &self,
        clusters: &ClusterMap,
        telemetry: &BTreeMap<FlightId, TrajectorySegment>,
        cruise: &BTreeSet<FlightId>,
        radius_nm: f64,
        curr_time: i64,
    ) -> ClusteringOutcome {
        match self {
            GroupingModel::Fifo => fifo(clusters, telemetry, cruise, radius_nm, curr_time),
        }
    }
}

/// 先着順（fifo）クラスタリング
///
/// 巡航中のフライトをID昇順に調べ、未所属のフライトごとに他の全巡航フライトと
/// 比較します。半径内かつ航跡が一致した相手は、その相手が既に属している
/// クラスタごと取り込まれます。先に調べられたフライトが相手を先取りします。
pub fn fifo(
    clusters: &ClusterMap,
    telemetry: &BTreeMap<FlightId, TrajectorySegment>,
    cruise: &BTreeSet<FlightId>,
    radius_nm: f64,
    curr_time: i64,
) -> ClusteringOutcome {
    let radius_m = geodesy::nm_to_m(radius_nm);
    let mut result = clusters.clone();

    for &flight in cruise {
        if result.is_clustered(flight) {
            continue;
        }
        let Some(own) = telemetry.get(&flight) else {
            continue;
        };
        for &other in cruise.iter().filter(|other| **other != flight) {
            let Some(theirs) = telemetry.get(&other) else {
                continue;
            };
            let separation = own.init_position().distance_to(&theirs.init_position());
            let matched = geodesy::tracks_match(own.track, theirs.track, TRACKS_DIFFERENCE_DEG);
            if separation <= radius_m && matched {
                trace!(
                    "t={} fifo: {} と {} を結合 (距離 {:.0}m)",
                    curr_time, flight, other, separation
                );
                result.merge(flight, other);
            }
        }
    }

    result.propagate();

    ClusteringOutcome {
        clustered: result.clustered_flights(),
        has_clusters: result.has_clusters(),
        changed: result != *clusters,
        clusters: result,
    }
}
