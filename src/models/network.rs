use petgraph::graphmap::DiGraphMap;
use petgraph::visit::Bfs;
use serde::{Deserialize, Serialize};

use crate::models::clustering::ClusterMap;
use crate::models::common::FlightId;

/// 巡航中フライトの有向グラフ
///
/// 合意済みクラスタ内の順序対ごとに1本の辺を張ります。毎タイムステップ作り直します。
/// ノードは追加順（ID昇順）に保持されます。
#[derive(Debug, Clone, Default)]
pub struct AircraftNetwork {
    graph: DiGraphMap<FlightId, ()>,
}

impl AircraftNetwork {
    pub fn new(nodes: impl IntoIterator<Item = FlightId>) -> Self {
        let mut ids: Vec<FlightId> = nodes.into_iter().collect();
        ids.sort_unstable();
        let mut graph = DiGraphMap::with_capacity(ids.len(), 0);
        for id in ids {
            graph.add_node(id);
        }
        Self { graph }
    }

    /// クラスタマップから辺を作成したネットワーク
    pub fn from_clusters(nodes: impl IntoIterator<Item = FlightId>, clusters: &ClusterMap) -> Self {
        let mut network = Self::new(nodes);
        for (flight, members) in clusters.iter() {
            for other in members.iter().filter(|other| *other != flight) {
                network.add_edge(*flight, *other);
            }
        }
        network
    }

    /// 両端がノードとして存在する場合のみ辺を追加
    pub fn add_edge(&mut self, from: FlightId, to: FlightId) {
        if self.graph.contains_node(from) && self.graph.contains_node(to) {
            self.graph.add_edge(from, to, ());
        }
    }

    pub fn node_count(&self) -> usize {
        self.graph.node_count()
    }

    pub fn edge_count(&self) -> usize {
        self.graph.edge_count()
    }

    /// 幅優先探索で到達可能なノード数（自分を含む）
    pub fn reachable_count(&self, source: FlightId) -> usize {
        if !self.graph.contains_node(source) {
            return 0;
        }
        let mut bfs = Bfs::new(&self.graph, source);
        let mut reached = 0;
        while bfs.next(&self.graph).is_some() {
            reached += 1;
        }
        reached
    }

    /// ノードごとの局所到達中心性（LRC）、ID昇順
    pub fn local_reaching_centrality(&self) -> Vec<f64> {
        let others = self.node_count().saturating_sub(1);
        if others == 0 {
            return vec![0.0; self.node_count()];
        }
        self.graph
            .nodes()
            .map(|id| (self.reachable_count(id) - 1) as f64 / others as f64)
            .collect()
    }

    /// 大域到達中心性（GRC）: 最大LRCとの差の平均
    pub fn global_reaching_centrality(&self) -> f64 {
        let lrc = self.local_reaching_centrality();
        if lrc.is_empty() {
            return 0.0;
        }
        let max = lrc.iter().copied().fold(f64::MIN, f64::max);
        lrc.iter().map(|v| max - v).sum::<f64>() / lrc.len() as f64
    }
}

/// GRCの集計値
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct GrcStats {
    pub sum: f64,
    pub max: f64,
    pub min: f64,
    pub updates: u64,
}

impl GrcStats {
    pub fn record(&mut self, grc: f64) {
        if self.updates == 0 {
            self.max = grc;
            self.min = grc;
        } else {
            self.max = self.max.max(grc);
            self.min = self.min.min(grc);
        }
        self.sum += grc;
        self.updates += 1;
    }

    pub fn average(&self) -> f64 {
        if self.updates == 0 {
            0.0
        } else {
            self.sum / self.updates as f64
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_disconnected_graph_has_zero_grc() {
        let network = AircraftNetwork::new([1, 2, 3, 4]);
        assert_eq!(network.local_reaching_centrality(), vec![0.0; 4]);
        assert_eq!(network.global_reaching_centrality(), 0.0);
    }

    #[test]
    fn test_complete_graph_has_zero_grc() {
        let mut clusters = ClusterMap::new([1, 2, 3]);
        clusters.merge(1, 2);
        clusters.merge(2, 3);
        let network = AircraftNetwork::from_clusters([1, 2, 3], &clusters);

        assert_eq!(network.edge_count(), 6);
        assert_eq!(network.local_reaching_centrality(), vec![1.0; 3]);
        assert_eq!(network.global_reaching_centrality(), 0.0);
    }

    #[test]
    fn test_partial_clustering_grc() {
        // {1,2} がクラスタ、3と4は単独
        let mut clusters = ClusterMap::new([1, 2, 3, 4]);
        clusters.merge(1, 2);
        let network = AircraftNetwork::from_clusters([1, 2, 3, 4], &clusters);

        let lrc = network.local_reaching_centrality();
        let third = 1.0 / 3.0;
        assert_eq!(lrc, vec![third, third, 0.0, 0.0]);
        // 最大LRCとの差 (0 + 0 + 1/3 + 1/3) を4ノードで平均
        let grc = network.global_reaching_centrality();
        assert!((grc - third / 2.0).abs() < 1e-12, "grc = {}", grc);
    }

    #[test]
    fn test_edges_to_non_cruising_flights_are_ignored() {
        let mut clusters = ClusterMap::new([1, 2, 3]);
        clusters.merge(1, 3);
        let network = AircraftNetwork::from_clusters([1, 2], &clusters);
        assert_eq!(network.edge_count(), 0);
        assert_eq!(network.reachable_count(1), 1);
        assert_eq!(network.reachable_count(3), 0);
    }

    #[test]
    fn test_reachability_follows_directed_edges() {
        let mut network = AircraftNetwork::new([3, 1, 2]);
        network.add_edge(1, 2);
        network.add_edge(2, 3);

        assert_eq!(network.reachable_count(1), 3);
        assert_eq!(network.reachable_count(2), 2);
        assert_eq!(network.reachable_count(3), 1);
        // ノード順はID昇順
        assert_eq!(network.local_reaching_centrality(), vec![1.0, 0.5, 0.0]);
        assert!((network.global_reaching_centrality() - 0.5).abs() < 1e-12);
    }

    #[test]
    fn test_grc_stats_tracks_extremes() {
        let mut stats = GrcStats::default();
        assert_eq!(stats.average(), 0.0);
        for grc in [0.25, 0.0, 0.5] {
            stats.record(grc);
        }
        assert_eq!(stats.updates, 3);
        assert_eq!(stats.max, 0.5);
        assert_eq!(stats.min, 0.0);
        assert!((stats.average() - 0.25).abs() < 1e-12);
    }
}
