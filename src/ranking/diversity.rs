// Author diversity — greedy interleave over the scored pool.
//
// At each slot, the highest-scoring remaining candidate whose author is not
// among the two most recent picks wins the slot. When the remaining pool is
// entirely blocked, one repeat is allowed as long as it doesn't create three
// consecutive posts by one author; a tail that can't even manage that is
// dropped. If the result would lose more than half the pool, diversity is
// abandoned and the pre-diversity order returned.

use crate::ranking::scoring::ScoredCandidate;

/// Apply the diversity pass. `pool` must already be sorted by the ranking
/// key (score descending).
pub fn diversify(pool: Vec<ScoredCandidate>) -> Vec<ScoredCandidate> {
    if pool.len() <= 2 {
        return pool;
    }

    let original_len = pool.len();
    let mut remaining = pool.clone();
    let mut out: Vec<ScoredCandidate> = Vec::with_capacity(original_len);

    while !remaining.is_empty() {
        let last_author = out.last().map(|c| c.post.author.clone());
        let prev_author = out
            .len()
            .checked_sub(2)
            .map(|i| out[i].post.author.clone());

        // Preferred: author absent from the last two slots
        let pick = remaining.iter().position(|c| {
            Some(&c.post.author) != last_author.as_ref()
                && Some(&c.post.author) != prev_author.as_ref()
        });

        // Relaxed: any author that doesn't make three in a row
        let pick = pick.or_else(|| {
            if last_author == prev_author && last_author.is_some() {
                // Two in a row already — the next must differ
                remaining
                    .iter()
                    .position(|c| Some(&c.post.author) != last_author.as_ref())
            } else {
                Some(0)
            }
        });

        match pick {
            Some(index) => out.push(remaining.remove(index)),
            None => break, // only three-in-a-row picks remain; drop the tail
        }
    }

    // Too destructive — the caller prefers raw ranking over a gutted page
    if out.len() * 2 < original_len {
        return pool;
    }

    out
}

/// True when no three consecutive entries share an author.
pub fn is_diverse(items: &[ScoredCandidate]) -> bool {
    items.windows(3).all(|w| {
        !(w[0].post.author == w[1].post.author && w[1].post.author == w[2].post.author)
    })
}
