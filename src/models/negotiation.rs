//! # クラスタ交渉プロトコル
//!
//! NMから提案されたクラスタ（2機以上）のメンバー同士が、フライト間の
//! 直接通信だけで参加可否を決めます。
//!
//! 1. 降下チェック: 次のタイムステップで降下を開始するフライトは脱落
//! 2. 単独チェック: 脱落者を除いた結果1機になれば不成立
//! 3. 接近: 前回合意したクラスタと異なる、または未合流なら群れ位置へ接近
//! 4. 燃料コストループ: 合流済みなら燃料比較を繰り返し、メンバーが
//!    変化しなくなるまで続ける
//!
//! 各段階の結果はメンバー全員と交換し、`false` を返したメンバーは
//! 受信側のローカルなクラスタから取り除かれます。全員が同じ情報で
//! 同じ順序の判断を行うため、メンバー間でクラスタが食い違うことはありません。

use std::collections::BTreeMap;

use tracing::{debug, trace};

use crate::comm::{CommError, Endpoint, Tag};
use crate::models::common::{FlightId, GeoPosition};
use crate::models::flocking::{
    fuel_cost_check, in_position, FlockingModel, FlockingResult, FuelFactors,
};
use crate::models::trajectory::TrajectorySegment;

/// 協調飛行のパラメータ（シナリオから一度だけ解決）
#[derive(Debug, Clone, PartialEq)]
pub struct CooperationParams {
    pub model: FlockingModel,
    pub time_step: i64,
    pub alone_fuel_parameter: f64,
    pub coop_fuel_parameter: f64,
    /// 接近完了とみなす1機あたりの距離（m）
    pub approached_distance_m: f64,
    /// 燃料コストループの上限回数（None = 上限なし）
    pub max_negotiation_rounds: Option<u32>,
}

/// 不成立の理由
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RejectReason {
    /// 提案が1機以下
    NotProposed,
    Descent,
    Alone,
    FuelCost,
}

impl std::fmt::Display for RejectReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            RejectReason::NotProposed => "NOT PROPOSED",
            RejectReason::Descent => "DESCENT",
            RejectReason::Alone => "ALONE",
            RejectReason::FuelCost => "FUEL COST",
        };
        f.write_str(s)
    }
}

/// 交渉結果
#[derive(Debug, Clone, PartialEq)]
pub enum NegotiationOutcome {
    Accepted {
        cluster: Vec<FlightId>,
        position: GeoPosition,
        level: i32,
        /// 全員が接近完了しているか（false なら接近中）
        joined: bool,
    },
    Rejected(RejectReason),
}

impl NegotiationOutcome {
    pub fn is_accepted(&self) -> bool {
        matches!(self, NegotiationOutcome::Accepted { .. })
    }
}

/// タイムステップをまたいで保持する合流状態
#[derive(Debug, Clone, Default, PartialEq)]
pub struct JoinState {
    pub joined: bool,
    pub last_accepted: Vec<FlightId>,
}

impl JoinState {
    fn reset(&mut self) {
        self.joined = false;
        self.last_accepted.clear();
    }

    /// 接近ステップが必要か
    fn needs_approach(&self, cluster: &[FlightId]) -> bool {
        !(self.joined && self.last_accepted == cluster)
    }
}

/// 交渉に必要な自機の情報
#[derive(Debug, Clone)]
pub struct NegotiationContext<'a> {
    pub flight: FlightId,
    pub params: &'a CooperationParams,
    /// 現タイムステップのセグメント
    pub current: &'a TrajectorySegment,
    pub top_of_descent: GeoPosition,
    pub kd: f64,
    pub curr_time: i64,
    pub descent_time: i64,
}

impl NegotiationContext<'_> {
    fn fuel_factors(&self) -> FuelFactors {
        FuelFactors {
            kd: self.kd,
            alone: self.params.alone_fuel_parameter,
            coop: self.params.coop_fuel_parameter,
        }
    }

    async fn flock(&self, endpoint: &mut Endpoint, cluster: &[FlightId]) -> Result<FlockingResult, CommError> {
        self.params
            .model
            .flock(endpoint, cluster, self.current, self.params.time_step)
            .await
    }
}

/// 提案されたクラスタについて交渉する
pub async fn negotiate(
    endpoint: &mut Endpoint,
    ctx: &NegotiationContext<'_>,
    proposal: &[FlightId],
    state: &mut JoinState,
) -> Result<NegotiationOutcome, CommError> {
    let mut cluster = proposal.to_vec();
    if cluster.len() <= 1 {
        state.reset();
        return Ok(NegotiationOutcome::Rejected(RejectReason::NotProposed));
    }
    debug!("Flight {} 交渉開始 t={} 提案 {:?}", ctx.flight, ctx.curr_time, cluster);

    let descent_ok = ctx.curr_time + ctx.params.time_step != ctx.descent_time;
    trace!("Flight {} DESCENT check {}", ctx.flight, pass_fail(descent_ok));
    share_decision(endpoint, &mut cluster, descent_ok).await?;
    if !descent_ok {
        return Ok(reject(ctx, state, RejectReason::Descent));
    }
    if cluster.len() <= 1 {
        return Ok(reject(ctx, state, RejectReason::Alone));
    }

    if state.needs_approach(&cluster) {
        let tentative = ctx.flock(endpoint, &cluster).await?;
        state.joined = approach(endpoint, ctx, &cluster, &tentative.position).await?;
        debug!("Flight {} JOINED - {}", ctx.flight, state.joined);
        if !state.joined {
            return Ok(accept(state, cluster, tentative, false));
        }
    }

    let mut rounds = 0u32;
    let converged = loop {
        let snapshot = cluster.clone();
        let tentative = ctx.flock(endpoint, &cluster).await?;
        let check = fuel_cost_check(
            &ctx.current.init_position(),
            &tentative.position,
            &ctx.top_of_descent,
            ctx.fuel_factors(),
        );
        let fuel_ok = check.passes();
        trace!(
            "Flight {} FUEL COST check {} (nominal {:.3}, cooperative {:.3})",
            ctx.flight,
            pass_fail(fuel_ok),
            check.nominal,
            check.cooperative
        );
        share_decision(endpoint, &mut cluster, fuel_ok).await?;
        if !fuel_ok {
            return Ok(reject(ctx, state, RejectReason::FuelCost));
        }
        if cluster.len() <= 1 {
            return Ok(reject(ctx, state, RejectReason::Alone));
        }
        if cluster == snapshot {
            break tentative;
        }
        rounds += 1;
        if ctx.params.max_negotiation_rounds.is_some_and(|max| rounds >= max) {
            debug!("Flight {} 交渉ループが上限 {} 回に達しました", ctx.flight, rounds);
            break tentative;
        }
    };

    Ok(accept(state, cluster, converged, true))
}

/// 接近判定: 暫定位置と在位置判定を2回交換する
async fn approach(
    endpoint: &mut Endpoint,
    ctx: &NegotiationContext<'_>,
    cluster: &[FlightId],
    tentative: &GeoPosition,
) -> Result<bool, CommError> {
    let positions: BTreeMap<FlightId, GeoPosition> =
        endpoint.exchange(cluster, Tag::Approaching, tentative).await?;
    let ready = in_position(
        tentative,
        positions.values(),
        cluster.len(),
        ctx.params.approached_distance_m,
    );
    let others: BTreeMap<FlightId, bool> = endpoint.exchange(cluster, Tag::Approaching, &ready).await?;
    Ok(ready && others.values().all(|r| *r))
}

/// 判断をメンバー全員と交換し、`false` を返したメンバーを取り除く
async fn share_decision(
    endpoint: &mut Endpoint,
    cluster: &mut Vec<FlightId>,
    decision: bool,
) -> Result<(), CommError> {
    let responses: BTreeMap<FlightId, bool> = endpoint.exchange(cluster.as_slice(), Tag::Clustered, &decision).await?;
    for (flight, clustered) in responses {
        if !clustered {
            trace!("{} がクラスタから離脱: Flight {}", endpoint.role(), flight);
            cluster.retain(|id| *id != flight);
        }
    }
    Ok(())
}

fn accept(
    state: &mut JoinState,
    cluster: Vec<FlightId>,
    flock: FlockingResult,
    joined: bool,
) -> NegotiationOutcome {
    state.last_accepted = cluster.clone();
    NegotiationOutcome::Accepted {
        cluster,
        position: flock.position,
        level: flock.level,
        joined,
    }
}

fn reject(ctx: &NegotiationContext<'_>, state: &mut JoinState, reason: RejectReason) -> NegotiationOutcome {
    debug!("Flight {} {} check - FAIL", ctx.flight, reason);
    state.reset();
    NegotiationOutcome::Rejected(reason)
}

fn pass_fail(ok: bool) -> &'static str {
    if ok { "PASS" } else { "FAIL" }
}
