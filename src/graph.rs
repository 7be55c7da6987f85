//! Timeline graph layout: assigns every displayed check-in to a rail
//! (vertical column) and routes primary-parent risers and merge arrows,
//! subject to a maximum-rail budget and a branch-priority hint.
//!
//! Rows are added in display order, top of the screen first, then
//! [`Graph::finish`] runs the layout. Each row comes out with its assigned
//! rail, the mask of rails occupied at that row, and per-rail riser/merge
//! annotations for the renderer.

use std::collections::HashMap;

/// Maximum number of rails; beyond this the graph is declared overfull and
/// the caller should fall back to a simpler layout.
pub const GR_MAX_RAIL: usize = 64;

/// Rows of margin kept above leaves and below initial rows so risers do
/// not collide with off-screen continuations.
const RISER_MARGIN: usize = 4;

const fn bit(n: usize) -> u64 {
    1u64 << n
}

/// Layout switches, mirroring the timeline display modes.
#[derive(Clone, Copy, Debug, Default)]
pub struct GraphFlags {
    /// Omit descenders (lines running to the bottom of the screen).
    pub disjoint: bool,
    /// Connect gaps with step-parent links.
    pub fillgaps: bool,
    /// Omit merge lines from off-screen check-ins.
    pub xmerge: bool,
}

/// One row of the graph. Input fields are set by [`Graph::add_row`];
/// layout outputs are filled by [`Graph::finish`].
#[derive(Clone, Debug)]
pub struct GraphRow {
    pub rid: i64,
    /// Parents; element 0 is the primary. Cherrypick parents come last.
    pub parents: Vec<i64>,
    /// How many of the tail entries of `parents` are cherrypicks.
    pub n_cherrypick: usize,
    pub branch: String,
    pub bgcolor: Option<String>,
    pub is_leaf: bool,

    /// 1-based display index; the top row is smallest.
    pub idx: usize,
    idx_top: usize,
    child: Option<usize>,
    n_merge_child: u32,
    /// True when the same rid appeared again further down; this copy is
    /// drawn on a dedicated rail.
    pub is_dup: bool,
    pub is_step_parent: bool,
    pub time_warp: bool,
    /// Riser from the bottom of the graph up to this node.
    pub b_descender: bool,
    /// Rows above this node still reserved for its riser: the up-extent to
    /// which the riser continues beyond the visible slice.
    pub self_up: usize,
    has_normal_out_merge: bool,

    /// Assigned rail, or -1 before layout.
    pub i_rail: i32,
    /// Rail the merge arrow leaves on, or -1.
    pub merge_out: i32,
    /// Incoming merge per rail: 0 none, 1 merge, 2 cherrypick.
    pub merge_in: [u8; GR_MAX_RAIL],
    /// Riser targets: `ai_riser[rail]` is the idx of the row the riser on
    /// that rail runs up to, or -1.
    pub ai_riser: [i32; GR_MAX_RAIL],
    /// Draw the merge-out rail up to this display index.
    pub merge_upto: usize,
    pub cherrypick_upto: usize,
    /// Merge/cherrypick lines arriving from below the graph, per rail.
    pub merge_down: u64,
    pub cherrypick_down: u64,
    /// Mask of rails occupied at this row.
    pub rail_in_use: u64,
}

impl GraphRow {
    pub fn n_non_cherrypick(&self) -> usize {
        self.parents.len() - self.n_cherrypick
    }
}

/// Graph context: rows plus layout-wide state.
pub struct Graph {
    rows: Vec<GraphRow>,
    hash: HashMap<i64, usize>,
    /// Highest rail used.
    pub mx_rail: i32,
    /// Set when the layout needed more than [`GR_MAX_RAIL`] rails.
    pub b_overfull: bool,
    merge_rail: u64,
    n_timewarp: usize,
    /// `rail_map[rail]` is the display column for that rail.
    pub rail_map: [u8; GR_MAX_RAIL + 1],
}

impl Default for Graph {
    fn default() -> Graph {
        Graph {
            rows: Vec::new(),
            hash: HashMap::new(),
            mx_rail: 0,
            b_overfull: false,
            merge_rail: 0,
            n_timewarp: 0,
            rail_map: [0; GR_MAX_RAIL + 1],
        }
    }
}

impl Graph {
    pub fn new() -> Graph {
        Graph::default()
    }

    pub fn rows(&self) -> &[GraphRow] {
        &self.rows
    }

    pub fn row_count(&self) -> usize {
        self.rows.len()
    }

    /// Add a row. Rows must arrive in display order, top first.
    pub fn add_row(
        &mut self,
        rid: i64,
        parents: Vec<i64>,
        n_cherrypick: usize,
        branch: &str,
        bgcolor: Option<&str>,
        is_leaf: bool,
    ) -> usize {
        let idx = self.rows.len() + 1;
        let n_cherrypick = if !parents.is_empty() && n_cherrypick >= parents.len() {
            parents.len() - 1
        } else {
            n_cherrypick
        };
        self.rows.push(GraphRow {
            rid,
            parents,
            n_cherrypick,
            branch: branch.to_string(),
            bgcolor: bgcolor.map(|z| z.to_string()),
            is_leaf,
            idx,
            idx_top: idx,
            child: None,
            n_merge_child: 0,
            is_dup: false,
            is_step_parent: false,
            time_warp: false,
            b_descender: false,
            self_up: 0,
            has_normal_out_merge: false,
            i_rail: -1,
            merge_out: -1,
            merge_in: [0; GR_MAX_RAIL],
            ai_riser: [-1; GR_MAX_RAIL],
            merge_upto: 0,
            cherrypick_upto: 0,
            merge_down: 0,
            cherrypick_down: 0,
            rail_in_use: 0,
        });
        idx
    }

    fn find(&self, rid: i64) -> Option<usize> {
        self.hash.get(&rid).copied()
    }

    /// Find a rail free over the row span `[top, btm]` (inclusive display
    /// indices), preferring the one nearest `near_to` and honoring the
    /// merge-rail partition.
    fn find_free_rail(&mut self, top: usize, btm: usize, near_to: i32, merge_rail: bool) -> i32 {
        let mut in_use: u64 = 0;
        for row in &self.rows {
            if row.idx < top || row.idx > btm {
                continue;
            }
            in_use |= row.rail_in_use;
        }
        let mut best: i32 = 0;
        let mut best_dist = 9999i32;
        for i in 0..=(self.mx_rail.max(0) as usize) {
            let m = bit(i);
            if in_use & m != 0 {
                continue;
            }
            if merge_rail != (self.merge_rail & m != 0) {
                continue;
            }
            if near_to <= 0 {
                best = i as i32;
                best_dist = 1;
                break;
            }
            let dist = (i as i32 - near_to).abs();
            if dist < best_dist {
                best_dist = dist;
                best = i as i32;
            }
        }
        if best_dist > 1000 {
            for i in 0..=(self.mx_rail.max(0) as usize + 1).min(GR_MAX_RAIL - 1) {
                if in_use & bit(i) != 0 {
                    continue;
                }
                if near_to <= 0 {
                    best = i as i32;
                    best_dist = 1;
                    break;
                }
                let dist = (i as i32 - near_to).abs();
                if dist < best_dist {
                    best_dist = dist;
                    best = i as i32;
                }
            }
        }
        if best_dist > 1000 || best as usize >= GR_MAX_RAIL {
            self.b_overfull = true;
            best = GR_MAX_RAIL as i32 - 1;
        }
        if best > self.mx_rail {
            self.mx_rail = best;
        }
        if merge_rail {
            self.merge_rail |= bit(best as usize);
        }
        best
    }

    /// True if `rail` is unoccupied from row index `from_idx` up to and
    /// including `to_idx` (to_idx is higher on the display).
    fn rail_is_clear(&self, from_idx: usize, to_idx: usize, rail: usize) -> bool {
        let m = bit(rail);
        for row in &self.rows {
            if row.idx >= to_idx && row.idx <= from_idx && row.rail_in_use & m != 0 {
                return false;
            }
        }
        true
    }

    /// Put every child in `bottom`'s child chain on the same rail.
    fn assign_children_to_rail(&mut self, bottom: usize, flags: GraphFlags) {
        let rail = self.rows[bottom].i_rail;
        let mask = bit(rail as usize);
        self.rows[bottom].rail_in_use |= mask;
        let mut prior = bottom;
        while let Some(cur) = self.rows[prior].child {
            if self.rows[prior].time_warp {
                break;
            }
            debug_assert!(self.rows[prior].idx > self.rows[cur].idx);
            self.rows[cur].i_rail = rail;
            self.rows[cur].rail_in_use |= mask;
            self.rows[prior].ai_riser[rail as usize] = self.rows[cur].idx as i32;
            let cur_idx = self.rows[cur].idx;
            let mut walk = prior;
            while self.rows[walk].idx > cur_idx {
                self.rows[walk].rail_in_use |= mask;
                walk -= 1;
            }
            prior = cur;
        }
        // Reserve extra rows so the riser to off-screen continuations has
        // clearance.
        if !self.rows[prior].is_leaf && !flags.disjoint {
            self.rows[prior].self_up = 0;
            let mut n = RISER_MARGIN;
            let mut i = prior as i64;
            while i >= 0 && n > 0 {
                self.rows[prior].self_up += 1;
                self.rows[i as usize].rail_in_use |= mask;
                i -= 1;
                n -= 1;
            }
        }
    }

    /// Riser from `row` to the top of the screen (its next child is above
    /// the visible slice).
    fn riser_to_top(&mut self, row: usize) {
        let rail = self.rows[row].i_rail as usize;
        let mask = bit(rail);
        self.rows[row].ai_riser[rail] = 0;
        let mut n = RISER_MARGIN;
        let mut i = row as i64;
        while i >= 0 && n > 0 {
            self.rows[i as usize].rail_in_use |= mask;
            i -= 1;
            n -= 1;
        }
    }

    fn find_max_rail(&mut self) {
        self.mx_rail = 0;
        for row in &self.rows {
            if row.i_rail > self.mx_rail {
                self.mx_rail = row.i_rail;
            }
            if row.merge_out > self.mx_rail {
                self.mx_rail = row.merge_out;
            }
            while (self.mx_rail as usize) < GR_MAX_RAIL - 1
                && (row.merge_down | row.cherrypick_down) > bit(self.mx_rail as usize + 1) - 1
            {
                self.mx_rail += 1;
            }
        }
    }

    /// Create a merge-arrow riser from `parent` up to `child`.
    fn create_merge_riser(&mut self, parent: usize, child: usize, is_cherrypick: bool) {
        if self.rows[parent].merge_out < 0 {
            let p_rail = self.rows[parent].i_rail as usize;
            let u = self.rows[parent].ai_riser[p_rail];
            let p_idx = self.rows[parent].idx;
            let c_idx = self.rows[child].idx;
            if u < 0 && (parent == 0 || self.rail_is_clear(p_idx - 1, c_idx, p_rail)) {
                // The parent is a leaf; the merge line goes straight up.
                self.rows[parent].merge_out = p_rail as i32;
                let mask = bit(p_rail);
                for i in child + 1..parent {
                    self.rows[i].rail_in_use |= mask;
                }
            } else if u > 0 && (u as usize) < c_idx {
                // The thick riser to the next primary child goes further up
                // than the merge arrow; share the rail.
                self.rows[parent].merge_out = p_rail as i32;
            } else if p_idx - c_idx < self.rows[parent].self_up {
                self.rows[parent].merge_out = p_rail as i32;
            } else {
                let target = self.rows[parent].i_rail;
                let rail = self.find_free_rail(c_idx, p_idx - 1, target, true);
                self.rows[parent].merge_out = rail;
                let mask = bit(rail as usize);
                for i in child + 1..parent {
                    self.rows[i].rail_in_use |= mask;
                }
            }
        }
        let c_idx = self.rows[child].idx;
        if is_cherrypick {
            if self.rows[parent].cherrypick_upto == 0 || self.rows[parent].cherrypick_upto > c_idx {
                self.rows[parent].cherrypick_upto = c_idx;
            }
        } else {
            self.rows[parent].has_normal_out_merge = true;
            if self.rows[parent].merge_upto == 0 || self.rows[parent].merge_upto > c_idx {
                self.rows[parent].merge_upto = c_idx;
            }
        }
        let out = self.rows[parent].merge_out as usize;
        self.rows[child].merge_in[out] = if is_cherrypick { 2 } else { 1 };
    }

    /// Run the layout. `left_branch` names the branch to pack against the
    /// left margin.
    pub fn finish(&mut self, left_branch: Option<&str>, flags: GraphFlags) {
        if self.rows.is_empty() {
            return;
        }
        let n = self.rows.len();

        // Hash rows by rid; an rid seen again lower down makes the earlier
        // copy a duplicate, and the hash resolves to the later one.
        self.hash.clear();
        let mut has_dup = false;
        for i in 0..n {
            if let Some(&prev) = self.hash.get(&self.rows[i].rid) {
                self.rows[prev].is_dup = true;
                has_dup = true;
            }
            self.hash.insert(self.rows[i].rid, i);
        }
        self.mx_rail = -1;
        let mut merge_riser_from = [0i64; GR_MAX_RAIL];

        // Purge off-screen merge parents when they would not be drawn.
        if flags.disjoint || flags.xmerge {
            for i in 0..n {
                let mut j = 1;
                while j < self.rows[i].parents.len() {
                    let prid = self.rows[i].parents[j];
                    if self.find(prid).is_none() {
                        let was_cherrypick = j >= self.rows[i].n_non_cherrypick();
                        self.rows[i].parents.remove(j);
                        if was_cherrypick {
                            self.rows[i].n_cherrypick -= 1;
                        }
                    } else {
                        j += 1;
                    }
                }
            }
        }

        // Put the deepest (earliest, or off-screen) merge parent first in
        // each parent class.
        for i in 0..n {
            if self.rows[i].parents.len() <= 1 {
                continue;
            }
            for j in 1..self.rows[i].parents.len() {
                let prid = self.rows[i].parents[j];
                if let Some(p) = self.find(prid) {
                    self.rows[p].n_merge_child += 1;
                }
            }
            let ncp = self.rows[i].n_cherrypick;
            let nncp = self.rows[i].n_non_cherrypick();
            if ncp > 1 {
                let mut best: Option<usize> = None;
                let mut deepest: i64 = -1;
                for j in nncp..self.rows[i].parents.len() {
                    match self.find(self.rows[i].parents[j]) {
                        None => {
                            best = Some(j);
                            break;
                        }
                        Some(p) => {
                            if self.rows[p].idx as i64 > deepest {
                                deepest = self.rows[p].idx as i64;
                                best = Some(j);
                            }
                        }
                    }
                }
                if let Some(b) = best {
                    if b > nncp {
                        self.rows[i].parents.swap(nncp, b);
                    }
                }
            }
            if nncp > 2 {
                let mut best: Option<usize> = None;
                let mut deepest: i64 = -1;
                for j in 1..nncp {
                    match self.find(self.rows[i].parents[j]) {
                        None => {
                            best = Some(j);
                            break;
                        }
                        Some(p) => {
                            if self.rows[p].idx as i64 > deepest {
                                deepest = self.rows[p].idx as i64;
                                best = Some(j);
                            }
                        }
                    }
                }
                if let Some(b) = best {
                    if b > 1 {
                        self.rows[i].parents.swap(1, b);
                    }
                }
            }
        }

        // Prefer a same-branch parent as the primary, so risers stay on
        // their branch.
        for i in 0..n {
            if self.rows[i].is_dup || self.rows[i].n_non_cherrypick() < 2 {
                continue;
            }
            let p0 = match self.find(self.rows[i].parents[0]) {
                Some(p) => p,
                None => continue,
            };
            if self.rows[p0].branch == self.rows[i].branch {
                continue;
            }
            for j in 1..self.rows[i].n_non_cherrypick() {
                if let Some(p) = self.find(self.rows[i].parents[j]) {
                    if self.rows[p].branch == self.rows[i].branch {
                        self.rows[i].parents.swap(0, j);
                        break;
                    }
                }
            }
        }

        // Choose each parent's on-rail child: the already-linked child
        // whose stack reaches highest. A child below its parent is a
        // timewarp.
        for i in 0..n {
            if self.rows[i].is_dup || self.rows[i].parents.is_empty() {
                continue;
            }
            let p = match self.find(self.rows[i].parents[0]) {
                Some(p) => p,
                None => continue,
            };
            if self.rows[p].branch != self.rows[i].branch {
                continue;
            }
            if self.rows[p].idx <= self.rows[i].idx {
                self.rows[p].time_warp = true;
                self.n_timewarp += 1;
            } else if self.rows[i].idx_top < self.rows[p].idx_top {
                self.rows[p].child = Some(i);
                self.rows[p].idx_top = self.rows[i].idx_top;
            }
        }

        if flags.fillgaps {
            // A parentless upper row on the same branch adopts a childless
            // lower row as a step-parent.
            for i in 0..n {
                if self.rows[i].child.is_some() || self.rows[i].is_leaf {
                    continue;
                }
                for j in (0..i).rev() {
                    if !self.rows[j].parents.is_empty()
                        && self.rows[j].branch == self.rows[i].branch
                        && self.find(self.rows[j].parents[0]).is_none()
                    {
                        self.rows[i].child = Some(j);
                        self.rows[i].is_step_parent = true;
                        self.rows[j].parents[0] = self.rows[i].rid;
                        break;
                    }
                }
            }
        }

        // Propagate idx_top down each child stack.
        for i in 0..n {
            if let Some(c) = self.rows[i].child {
                if self.rows[i].idx_top > self.rows[c].idx_top {
                    self.rows[i].idx_top = self.rows[c].idx_top;
                }
            }
        }

        let riser_margin = if flags.disjoint { 0 } else { RISER_MARGIN };

        // Pass 1: rows with no visible primary parent get a fresh rail,
        // trunk first so it lands on rail 0.
        for pass in 0..2 {
            for i in (0..n).rev() {
                if pass == 0 && self.rows[i].branch != "trunk" {
                    continue;
                }
                if self.rows[i].i_rail >= 0 || self.rows[i].is_dup {
                    continue;
                }
                let no_visible_parent = self.rows[i].parents.is_empty()
                    || self.find(self.rows[i].parents[0]).is_none();
                if !no_visible_parent {
                    continue;
                }
                let top = self.rows[i].idx_top;
                let btm = self.rows[i].idx + riser_margin;
                let rail = self.find_free_rail(top, btm, 0, false);
                self.rows[i].i_rail = rail;
                let mask = bit(rail as usize);
                if !flags.disjoint {
                    self.rows[i].b_descender = !self.rows[i].parents.is_empty();
                    let mut m = RISER_MARGIN;
                    let mut k = i;
                    while k < n && m > 0 {
                        self.rows[k].rail_in_use |= mask;
                        k += 1;
                        m -= 1;
                    }
                }
                self.assign_children_to_rail(i, flags);
            }
        }

        // Pass 2: everything else inherits its parent's rail when free.
        for i in (0..n).rev() {
            if self.rows[i].i_rail >= 0 {
                if self.rows[i].child.is_none()
                    && !self.rows[i].time_warp
                    && !flags.disjoint
                    && !self.rows[i].is_leaf
                {
                    self.riser_to_top(i);
                }
                continue;
            }
            if self.rows[i].is_dup {
                continue;
            }
            debug_assert!(!self.rows[i].parents.is_empty());
            let parent = match self.find(self.rows[i].parents[0]) {
                Some(p) => p,
                None => {
                    self.mx_rail += 1;
                    let mut rail = self.mx_rail;
                    if rail as usize >= GR_MAX_RAIL {
                        rail = GR_MAX_RAIL as i32 - 1;
                        self.mx_rail = rail;
                        self.b_overfull = true;
                    }
                    self.rows[i].i_rail = rail;
                    self.rows[i].rail_in_use = bit(rail as usize);
                    continue;
                }
            };
            if self.rows[parent].idx > self.rows[i].idx {
                // Common case: the parent is below this row.
                let top = self.rows[i].idx_top;
                let p_idx = self.rows[parent].idx;
                let near = self.rows[parent].i_rail;
                let rail = self.find_free_rail(top, p_idx, near, false);
                self.rows[i].i_rail = rail;
                self.rows[parent].ai_riser[rail as usize] = self.rows[i].idx as i32;
            } else {
                // Timewarp: the parent is above this row on the display.
                self.mx_rail += 1;
                let mut down_rail = self.mx_rail;
                if down_rail < 1 {
                    self.mx_rail += 1;
                    down_rail = self.mx_rail;
                }
                if down_rail as usize >= GR_MAX_RAIL {
                    down_rail = GR_MAX_RAIL as i32 - 1;
                    self.mx_rail = down_rail;
                    self.b_overfull = true;
                }
                self.mx_rail += 1;
                let mut rail = self.mx_rail;
                if rail as usize >= GR_MAX_RAIL {
                    rail = GR_MAX_RAIL as i32 - 1;
                    self.mx_rail = rail;
                    self.b_overfull = true;
                }
                self.rows[i].i_rail = rail;
                self.rows[i].rail_in_use = bit(rail as usize);
                self.rows[parent].ai_riser[down_rail as usize] = self.rows[i].idx as i32;
                let mask = bit(down_rail as usize);
                for row in self.rows.iter_mut() {
                    row.rail_in_use |= mask;
                }
            }
            let mask = bit(self.rows[i].i_rail as usize);
            self.rows[i].rail_in_use |= mask;
            if self.rows[i].child.is_some() {
                self.assign_children_to_rail(i, flags);
            } else if !flags.disjoint && !self.rows[i].is_leaf && !self.rows[i].time_warp {
                self.riser_to_top(i);
            }
            // Claim the span between this row and its parent.
            if self.rows[parent].idx > self.rows[i].idx {
                for k in i + 1..parent {
                    self.rows[k].rail_in_use |= mask;
                }
            } else {
                for k in parent + 1..i {
                    self.rows[k].rail_in_use |= mask;
                }
            }
        }

        // Merge risers and merge arrows.
        for i in 0..n {
            let mut reuse_idx: i64 = -1;
            let mut reuse_rail: i32 = -1;
            let mut is_cherrypick = false;
            for j in 1..self.rows[i].parents.len() {
                let prid = self.rows[i].parents[j];
                if j == self.rows[i].n_non_cherrypick() {
                    is_cherrypick = true;
                }
                match self.find(prid) {
                    None => {
                        // Merge from an off-screen node: children of the
                        // same off-screen parent share one rail.
                        if reuse_idx >= (n as i64) + 1 {
                            continue;
                        }
                        let mut mrail: i32 = -1;
                        for (k, &src) in merge_riser_from.iter().enumerate() {
                            if src == prid {
                                mrail = k as i32;
                                break;
                            }
                        }
                        if mrail < 0 {
                            let last_idx = self.rows[n - 1].idx;
                            mrail = self.find_free_rail(self.rows[i].idx, last_idx, 0, true);
                            merge_riser_from[mrail as usize] = prid;
                        }
                        reuse_idx = (n as i64) + 1;
                        reuse_rail = mrail;
                        let mask = bit(mrail as usize);
                        if j >= self.rows[i].n_non_cherrypick() {
                            self.rows[i].merge_in[mrail as usize] = 2;
                            self.rows[i].cherrypick_down |= mask;
                        } else {
                            self.rows[i].merge_in[mrail as usize] = 1;
                            self.rows[i].merge_down |= mask;
                        }
                        for k in i + 1..n {
                            self.rows[k].rail_in_use |= mask;
                        }
                    }
                    Some(p) => {
                        if reuse_idx > self.rows[p].idx as i64 && self.rows[p].n_merge_child == 1 {
                            // Reuse an existing riser.
                            self.rows[p].merge_out = reuse_rail;
                            if is_cherrypick {
                                self.rows[p].cherrypick_upto = self.rows[p].idx;
                            } else {
                                self.rows[p].has_normal_out_merge = true;
                                self.rows[p].merge_upto = self.rows[p].idx;
                            }
                            let out = reuse_rail as usize;
                            self.rows[i].merge_in[out] = if is_cherrypick { 2 } else { 1 };
                        } else {
                            self.create_merge_riser(p, i, is_cherrypick);
                            if reuse_idx < 0
                                && self.rows[p].n_merge_child == 1
                                && (self.rows[p].i_rail != self.rows[p].merge_out
                                    || self.rows[p].is_leaf)
                            {
                                reuse_idx = self.rows[p].idx as i64;
                                reuse_rail = self.rows[p].merge_out;
                            }
                        }
                    }
                }
            }
        }

        // Duplicates draw on a dedicated high rail, connected to their
        // primary copy by a merge line.
        if has_dup && (self.mx_rail as usize) < GR_MAX_RAIL {
            self.find_max_rail();
            let mut mx = self.mx_rail;
            let dup_rail = mx + 1;
            for i in 0..n {
                if !self.rows[i].is_dup {
                    continue;
                }
                self.rows[i].i_rail = dup_rail.min(GR_MAX_RAIL as i32 - 1);
                let primary = self.find(self.rows[i].rid).unwrap();
                if primary != i {
                    self.create_merge_riser(primary, i, false);
                    if self.rows[primary].merge_out > mx {
                        mx = self.rows[primary].merge_out;
                    }
                }
            }
            if dup_rail <= mx {
                let bumped = (mx + 1).min(GR_MAX_RAIL as i32 - 1);
                for row in self.rows.iter_mut() {
                    if row.is_dup {
                        row.i_rail = bumped;
                    }
                }
            }
        }

        self.find_max_rail();
        if self.mx_rail as usize >= GR_MAX_RAIL {
            self.b_overfull = true;
        }
        if self.b_overfull {
            // The caller-visible maximum rail is pinned at the budget.
            self.mx_rail = GR_MAX_RAIL as i32;
        }

        // Column reordering: pack the preferred branch at the left margin.
        // Timewarp arrows do not survive reordering, so skip it then.
        for (i, slot) in self.rail_map.iter_mut().enumerate() {
            *slot = i as u8;
        }
        if self.n_timewarp == 0 {
            let mx = (self.mx_rail as usize).min(GR_MAX_RAIL - 1);
            let mut priority = [0u16; GR_MAX_RAIL];
            if let Some(preferred) = left_branch {
                for i in 0..n {
                    if self.rows[i].branch != preferred {
                        continue;
                    }
                    let rail = self.rows[i].i_rail;
                    if rail >= 0 {
                        priority[rail as usize] |= 4;
                    }
                    for r in 0..=mx {
                        if self.rows[i].merge_in[r] != 0 {
                            priority[r] |= 1;
                        }
                    }
                    if self.rows[i].merge_out >= 0 {
                        priority[self.rows[i].merge_out as usize] |= 1;
                    }
                }
                for (r, p) in priority.iter_mut().enumerate().take(mx + 1) {
                    if self.merge_rail & bit(r) != 0 {
                        *p |= 2;
                    }
                }
            } else {
                priority[0] = 4;
                for i in 0..n {
                    if self.rows[i].i_rail != 0 {
                        continue;
                    }
                    for r in 0..=mx {
                        if self.rows[i].merge_in[r] != 0 {
                            priority[r] |= 1;
                        }
                    }
                    if self.rows[i].merge_out >= 0 {
                        priority[self.rows[i].merge_out as usize] |= 1;
                    }
                }
            }
            let mut col = 0u8;
            for r in 0..=mx {
                if priority[r] >= 4 {
                    self.rail_map[r] = col;
                    col += 1;
                }
            }
            for r in (0..=mx).rev() {
                if priority[r] == 3 {
                    self.rail_map[r] = col;
                    col += 1;
                }
            }
            for r in 0..=mx {
                if priority[r] == 1 || priority[r] == 2 {
                    self.rail_map[r] = col;
                    col += 1;
                }
            }
            for r in 0..=mx {
                if priority[r] == 0 {
                    self.rail_map[r] = col;
                    col += 1;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn finish(g: &mut Graph) {
        g.finish(None, GraphFlags::default());
    }

    /// A straight line of commits stays on one rail.
    #[test]
    fn linear_history_single_rail() {
        let mut g = Graph::new();
        // newest first: 3 -> 2 -> 1
        g.add_row(3, vec![2], 0, "trunk", None, true);
        g.add_row(2, vec![1], 0, "trunk", None, false);
        g.add_row(1, vec![], 0, "trunk", None, false);
        finish(&mut g);
        assert!(!g.b_overfull);
        let rails: Vec<i32> = g.rows().iter().map(|r| r.i_rail).collect();
        assert!(rails.iter().all(|&r| r == rails[0]));
        // The riser from row 2 runs up to row index of rid 3.
        let r2 = &g.rows()[1];
        assert_eq!(r2.ai_riser[r2.i_rail as usize], 1);
    }

    /// A fork occupies two rails and the branch rail differs from trunk.
    #[test]
    fn fork_uses_two_rails() {
        let mut g = Graph::new();
        g.add_row(4, vec![1], 0, "feat", None, true);
        g.add_row(3, vec![1], 0, "trunk", None, true);
        g.add_row(1, vec![], 0, "trunk", None, false);
        finish(&mut g);
        assert!(!g.b_overfull);
        let trunk_rail = g.rows()[1].i_rail;
        let feat_rail = g.rows()[0].i_rail;
        assert_ne!(trunk_rail, feat_rail);
        assert_eq!(g.rows()[2].i_rail, trunk_rail);
    }

    /// Merge parents draw a thin riser into the child.
    #[test]
    fn merge_arrow_recorded() {
        let mut g = Graph::new();
        // 4 merges 3 into trunk: parents [2, 3]
        g.add_row(4, vec![2, 3], 0, "trunk", None, true);
        g.add_row(3, vec![1], 0, "feat", None, true);
        g.add_row(2, vec![1], 0, "trunk", None, false);
        g.add_row(1, vec![], 0, "trunk", None, false);
        finish(&mut g);
        assert!(!g.b_overfull);
        let feat = &g.rows()[1];
        assert!(feat.merge_out >= 0);
        let child = &g.rows()[0];
        assert_eq!(child.merge_in[feat.merge_out as usize], 1);
        assert!(feat.has_normal_out_merge);
    }

    /// Cherrypick parents are flagged 2 on the incoming rail.
    #[test]
    fn cherrypick_flagged() {
        let mut g = Graph::new();
        g.add_row(4, vec![2, 3], 1, "trunk", None, true);
        g.add_row(3, vec![1], 0, "feat", None, true);
        g.add_row(2, vec![1], 0, "trunk", None, false);
        g.add_row(1, vec![], 0, "trunk", None, false);
        finish(&mut g);
        let feat = &g.rows()[1];
        assert!(feat.merge_out >= 0);
        assert_eq!(g.rows()[0].merge_in[feat.merge_out as usize], 2);
        assert!(g.rows()[0].cherrypick_upto == 0);
    }

    /// Off-screen merge parents shared by several children use one rail.
    #[test]
    fn offscreen_merge_parent_shares_rail() {
        let mut g = Graph::new();
        g.add_row(10, vec![9, 99], 0, "trunk", None, true);
        g.add_row(9, vec![8, 99], 0, "trunk", None, false);
        g.add_row(8, vec![], 0, "trunk", None, false);
        finish(&mut g);
        let r10 = &g.rows()[0];
        let r9 = &g.rows()[1];
        let rail10 = r10.merge_in.iter().position(|&m| m == 1).unwrap();
        let rail9 = r9.merge_in.iter().position(|&m| m == 1).unwrap();
        assert_eq!(rail10, rail9);
        assert!(r10.merge_down & (1 << rail10) != 0);
    }

    /// With XMERGE, off-screen merge parents are purged instead.
    #[test]
    fn xmerge_purges_offscreen_parents() {
        let mut g = Graph::new();
        g.add_row(10, vec![9, 99], 0, "trunk", None, true);
        g.add_row(9, vec![], 0, "trunk", None, false);
        g.finish(
            None,
            GraphFlags {
                xmerge: true,
                ..Default::default()
            },
        );
        assert_eq!(g.rows()[0].parents.len(), 1);
        assert!(g.rows()[0].merge_in.iter().all(|&m| m == 0));
    }

    /// Scenario S6: more concurrent branches than rails sets b_overfull
    /// and caps the visible rail at the budget.
    #[test]
    fn overflow_sets_flag() {
        let mut g = Graph::new();
        // 80 concurrent leaves, each rooted off-screen at a distinct
        // parent, all alive across the whole slice.
        for i in 0..80i64 {
            g.add_row(1000 + i, vec![2000 + i], 0, &format!("b{i}"), None, true);
        }
        for i in 0..80i64 {
            g.add_row(2000 + i, vec![], 0, &format!("b{i}"), None, false);
        }
        finish(&mut g);
        assert!(g.b_overfull);
        assert_eq!(g.mx_rail, GR_MAX_RAIL as i32);
        for row in g.rows() {
            assert!(row.i_rail < GR_MAX_RAIL as i32);
        }
    }

    /// Below the budget, many branches still fit without overfull.
    #[test]
    fn many_branches_within_budget() {
        let mut g = Graph::new();
        for i in 0..20i64 {
            g.add_row(100 + i, vec![1], 0, &format!("b{i}"), None, true);
        }
        g.add_row(1, vec![], 0, "trunk", None, false);
        finish(&mut g);
        assert!(!g.b_overfull);
        assert!(g.mx_rail < GR_MAX_RAIL as i32);
    }

    /// A duplicated rid is drawn on its own high rail.
    #[test]
    fn duplicate_rids() {
        let mut g = Graph::new();
        g.add_row(5, vec![1], 0, "trunk", None, true);
        g.add_row(1, vec![], 0, "trunk", None, false);
        g.add_row(5, vec![1], 0, "trunk", None, false);
        finish(&mut g);
        let dups: Vec<&GraphRow> = g.rows().iter().filter(|r| r.is_dup).collect();
        assert_eq!(dups.len(), 1);
        let normal_max = g
            .rows()
            .iter()
            .filter(|r| !r.is_dup)
            .map(|r| r.i_rail)
            .max()
            .unwrap();
        assert!(dups[0].i_rail > normal_max);
    }

    /// A child dated before its parent is flagged as a timewarp and the
    /// rail map stays identity.
    #[test]
    fn timewarp_detected() {
        let mut g = Graph::new();
        // Display order puts parent 2 above child 3 (child is lower =
        // earlier), same branch.
        g.add_row(2, vec![1], 0, "trunk", None, false);
        g.add_row(3, vec![2], 0, "trunk", None, true);
        g.add_row(1, vec![], 0, "trunk", None, false);
        finish(&mut g);
        assert!(g.rows().iter().any(|r| r.time_warp));
        let mx = g.mx_rail as usize;
        for r in 0..=mx {
            assert_eq!(g.rail_map[r], r as u8);
        }
    }

    /// The preferred branch is mapped to the leftmost column.
    #[test]
    fn preferred_branch_packs_left() {
        let mut g = Graph::new();
        g.add_row(4, vec![1], 0, "feat", None, true);
        g.add_row(3, vec![1], 0, "trunk", None, true);
        g.add_row(1, vec![], 0, "trunk", None, false);
        g.finish(Some("feat"), GraphFlags::default());
        let feat_rail = g.rows()[0].i_rail as usize;
        assert_eq!(g.rail_map[feat_rail], 0);
    }
}
