//! Token and forward-link storage.
//!
//! Tokens and links are small, numerous and short-lived, and they form a
//! cyclic object graph (token → link → token, plus intra-frame epsilon
//! links), so they live in per-decoder arenas addressed by `u32` ids with
//! free lists for reuse. `NONE` (`u32::MAX`) is the null id.

pub type TokenId = u32;
pub type LinkId = u32;

/// Null id for both token and link arenas.
pub const NONE: u32 = u32::MAX;

/// The best hypothesis currently reaching one graph state on one frame.
#[derive(Debug, Clone, Copy)]
pub struct Token {
    /// Best path cost from the start into this (state, frame).
    pub tot_cost: f32,
    /// Forward slack vs. the best token on this frame; +inf schedules
    /// deletion (no surviving forward link).
    pub extra_cost: f32,
    /// Head of this token's outgoing link list.
    pub links: LinkId,
    /// Next token on the same frame's list.
    pub next: TokenId,
}

/// An outgoing transition from a token to a token on the same frame
/// (epsilon) or the next frame (emitting).
#[derive(Debug, Clone, Copy)]
pub struct ForwardLink {
    pub next_tok: TokenId,
    /// Transition-id; 0 for non-emitting links.
    pub ilabel: u32,
    /// Word-id, or a synthetic state-label at chunk boundaries.
    pub olabel: u32,
    pub graph_cost: f32,
    pub acoustic_cost: f32,
    pub next: LinkId,
}

/// Per-frame token list head plus the pruner's two dirty flags.
#[derive(Debug, Clone, Copy)]
pub struct FrameSlot {
    pub head: TokenId,
    pub must_prune_forward_links: bool,
    pub must_prune_tokens: bool,
}

impl FrameSlot {
    pub fn new() -> Self {
        FrameSlot {
            head: NONE,
            must_prune_forward_links: true,
            must_prune_tokens: true,
        }
    }
}

impl Default for FrameSlot {
    fn default() -> Self {
        FrameSlot::new()
    }
}

/// Arena for one decoder instance's tokens and links.
pub struct TokenPool {
    toks: Vec<Token>,
    free_toks: Vec<TokenId>,
    links: Vec<ForwardLink>,
    free_links: Vec<LinkId>,
}

impl TokenPool {
    pub fn new() -> Self {
        TokenPool {
            toks: Vec::new(),
            free_toks: Vec::new(),
            links: Vec::new(),
            free_links: Vec::new(),
        }
    }

    pub fn new_token(&mut self, tot_cost: f32, extra_cost: f32, next: TokenId) -> TokenId {
        let t = Token {
            tot_cost,
            extra_cost,
            links: NONE,
            next,
        };
        if let Some(id) = self.free_toks.pop() {
            self.toks[id as usize] = t;
            id
        } else {
            self.toks.push(t);
            (self.toks.len() - 1) as TokenId
        }
    }

    pub fn free_token(&mut self, id: TokenId) {
        self.free_toks.push(id);
    }

    pub fn new_link(
        &mut self,
        next_tok: TokenId,
        ilabel: u32,
        olabel: u32,
        graph_cost: f32,
        acoustic_cost: f32,
        next: LinkId,
    ) -> LinkId {
        let l = ForwardLink {
            next_tok,
            ilabel,
            olabel,
            graph_cost,
            acoustic_cost,
            next,
        };
        if let Some(id) = self.free_links.pop() {
            self.links[id as usize] = l;
            id
        } else {
            self.links.push(l);
            (self.links.len() - 1) as LinkId
        }
    }

    pub fn free_link(&mut self, id: LinkId) {
        self.free_links.push(id);
    }

    #[inline]
    pub fn tok(&self, id: TokenId) -> &Token {
        &self.toks[id as usize]
    }

    #[inline]
    pub fn tok_mut(&mut self, id: TokenId) -> &mut Token {
        &mut self.toks[id as usize]
    }

    #[inline]
    pub fn link(&self, id: LinkId) -> &ForwardLink {
        &self.links[id as usize]
    }

    #[inline]
    pub fn link_mut(&mut self, id: LinkId) -> &mut ForwardLink {
        &mut self.links[id as usize]
    }

    /// Free a token's whole outgoing link chain and reset its head.
    pub fn delete_forward_links(&mut self, tok: TokenId) {
        let mut l = self.tok(tok).links;
        while l != NONE {
            let next = self.link(l).next;
            self.free_link(l);
            l = next;
        }
        self.tok_mut(tok).links = NONE;
    }

    /// Drop every token and link (utterance teardown).
    pub fn reset(&mut self) {
        self.toks.clear();
        self.free_toks.clear();
        self.links.clear();
        self.free_links.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_token_reuse_after_free() {
        let mut pool = TokenPool::new();
        let a = pool.new_token(1.0, 0.0, NONE);
        let b = pool.new_token(2.0, 0.0, a);
        pool.free_token(a);
        let c = pool.new_token(3.0, 0.0, NONE);
        assert_eq!(c, a); // freed slot is reused
        assert_eq!(pool.tok(b).next, a);
        assert_eq!(pool.tok(c).tot_cost, 3.0);
    }

    #[test]
    fn test_delete_forward_links_frees_chain() {
        let mut pool = TokenPool::new();
        let t = pool.new_token(0.0, 0.0, NONE);
        let dst = pool.new_token(1.0, 0.0, NONE);
        let l0 = pool.new_link(dst, 1, 0, 0.5, 0.0, NONE);
        let l1 = pool.new_link(dst, 2, 0, 0.5, 0.0, l0);
        pool.tok_mut(t).links = l1;

        pool.delete_forward_links(t);
        assert_eq!(pool.tok(t).links, NONE);
        // Both link slots come back from the free list.
        let m0 = pool.new_link(dst, 3, 0, 0.0, 0.0, NONE);
        let m1 = pool.new_link(dst, 4, 0, 0.0, 0.0, NONE);
        assert!(m0 == l0 || m0 == l1);
        assert!(m1 == l0 || m1 == l1);
        assert_ne!(m0, m1);
    }
}
