use crate::random::RandomSource;

/// Train/eval switch handed to every forward call. Training carries the
/// random source used for dropout and drop-path masks.
pub enum Mode<'r> {
    Eval,
    Train(&'r mut dyn RandomSource),
}

impl<'r> Mode<'r> {
    pub fn is_training(&self) -> bool {
        matches!(self, Mode::Train(_))
    }

    /// `p` while training, 0 otherwise.
    pub fn effective_p(&self, p: f32) -> f32 {
        if self.is_training() {
            p
        } else {
            0.0
        }
    }
}

impl std::fmt::Debug for Mode<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Mode::Eval => write!(f, "Eval"),
            Mode::Train(_) => write!(f, "Train"),
        }
    }
}
