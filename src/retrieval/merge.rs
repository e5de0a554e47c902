//! 检索结果合并：按 source_id 去重（保留最高分），按分数降序；同分按来源更新时间（新者在前），
//! 再按首次出现顺序。合并是幂等且确定的。

use std::cmp::Ordering;
use std::collections::HashMap;

use crate::retrieval::RetrievalHit;

pub fn merge_results(lists: Vec<Vec<RetrievalHit>>) -> Vec<RetrievalHit> {
    // source_id -> (首次出现序号, 当前保留的 hit)
    let mut best: HashMap<String, (usize, RetrievalHit)> = HashMap::new();
    let mut seen = 0usize;
    for hit in lists.into_iter().flatten() {
        match best.get_mut(&hit.source_id) {
            Some((_, kept)) => {
                if hit.score > kept.score {
                    *kept = hit;
                }
            }
            None => {
                best.insert(hit.source_id.clone(), (seen, hit));
            }
        }
        seen += 1;
    }

    let mut merged: Vec<(usize, RetrievalHit)> = best.into_values().collect();
    merged.sort_by(|(ia, a), (ib, b)| {
        b.score
            .total_cmp(&a.score)
            .then_with(|| match (a.updated_at, b.updated_at) {
                (Some(x), Some(y)) => y.cmp(&x),
                (Some(_), None) => Ordering::Less,
                (None, Some(_)) => Ordering::Greater,
                (None, None) => Ordering::Equal,
            })
            .then_with(|| ia.cmp(ib))
    });
    merged.into_iter().map(|(_, h)| h).collect()
}
