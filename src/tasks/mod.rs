mod idle_reaper;

pub use idle_reaper::IdleReaperTask;
