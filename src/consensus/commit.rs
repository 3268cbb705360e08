/// Highest log index replicated on a strict majority of the voting
/// membership, counting the leader's own tail.
///
/// `peer_matches` holds the match index of every voting peer; `voter_count`
/// is the total number of voters including the leader. Returns 0 when no
/// index has majority support yet.
///
/// The caller must still gate the result on the current-term check before
/// committing: an index only commits once an entry of the leader's own term
/// is majority-replicated.
pub fn majority_match_index(peer_matches: &[u64], leader_last: u64, voter_count: usize) -> u64 {
    if voter_count == 0 {
        return 0;
    }
    let majority = voter_count / 2 + 1;

    let mut acked: Vec<u64> = Vec::with_capacity(peer_matches.len() + 1);
    acked.extend_from_slice(peer_matches);
    acked.push(leader_last);
    acked.sort_unstable_by(|a, b| b.cmp(a));

    if acked.len() < majority {
        return 0;
    }
    acked[majority - 1]
}
