//! Enumeration of candidate tile factors for a loop-extent vector.

use divrem::DivCeil;
use smallvec::smallvec;

use crate::common::{Extents, PARALLELISM_FLOOR};

/// Returns candidate tile-factor tuples for the extents `s`, one factor per
/// dimension. A factor is the number of *outer* iterations the dimension is
/// split into. The all-ones and all-full tuples are suppressed as trivial.
///
/// With `allow_splits`, both power-of-two walks are enumerated per
/// dimension: outer count doubling upward and inner extent doubling (so the
/// outer count is the ceiling of the remaining quotient). Walks stop once
/// the outer count passes the inner extent, and dimension 0 additionally
/// refuses inner extents below the parallelism floor on the upward walk.
///
/// Without `allow_splits` (the sliding-window case) each dimension offers
/// only the two degenerate factors 1 and the full extent.
pub fn generate_tilings(s: &[i64], allow_splits: bool) -> Vec<Extents> {
    tilings_of_prefix(s, s.len(), allow_splits)
}

fn tilings_of_prefix(s: &[i64], dims: usize, allow_splits: bool) -> Vec<Extents> {
    let mut result = Vec::new();
    if dims == 0 {
        result.push(smallvec![]);
        return result;
    }
    let d = dims - 1;
    for t in tilings_of_prefix(s, d, allow_splits) {
        // Trivial tilings are only detectable once the last dimension's
        // factor is chosen.
        let mut is_one = false;
        let mut is_full = false;
        if d == s.len() - 1 {
            is_one = t.iter().all(|&f| f == 1);
            is_full = t.iter().zip(s).all(|(&f, &e)| f == e);
        }
        if !allow_splits {
            if !is_one {
                let mut candidate = t.clone();
                candidate.push(1);
                result.push(candidate);
            }
            if s[d] != 1 && !is_full {
                let mut candidate = t.clone();
                candidate.push(s[d]);
                result.push(candidate);
            }
        } else {
            let mut outer = 1;
            while outer <= s[d] {
                let inner = DivCeil::div_ceil(s[d], outer);
                if !(is_one && outer == 1) && !(is_full && outer == s[d]) {
                    if outer > inner || (d == 0 && inner < PARALLELISM_FLOOR) {
                        break;
                    }
                    let mut candidate = t.clone();
                    candidate.push(outer);
                    result.push(candidate);
                }
                outer *= 2;
            }
            let mut inner = 1;
            while inner < s[d] {
                let outer = DivCeil::div_ceil(s[d], inner);
                if !(is_one && outer == 1) && !(is_full && outer == s[d]) {
                    if inner >= outer {
                        break;
                    }
                    let mut candidate = t.clone();
                    candidate.push(outer);
                    result.push(candidate);
                }
                inner *= 2;
            }
        }
    }
    result
}
