// GPU timestamp profiler
//
// Markers pushed while recording form a tree per frame: each
// push/pop pair brackets a range of commands with two timestamp
// queries. After the frame's fence the query results resolve into
// milliseconds using the device timestamp period.

use ash::vk;

/// One resolved push/pop scope.
#[derive(Debug, Clone, Copy)]
pub struct TimestampResult {
    pub name: &'static str,
    pub depth: u16,
    pub elapsed_ms: f64,
    /// Absolute frame the scope was recorded in.
    pub frame: u64,
}

#[derive(Debug, Clone, Copy, Default)]
struct Timestamp {
    start: u32,
    end: u32,
    parent: u16,
    depth: u16,
    name: &'static str,
    elapsed_ms: f64,
    frame: u64,
}

/// Assigns query indices to push/pop scopes and reads them back.
///
/// Query slots are partitioned per in-flight frame: frame F owns
/// queries `[F * queries_per_frame * 2, (F+1) * queries_per_frame * 2)`.
pub struct Profiler {
    p_queries_per_frame: u32,
    p_max_frames: u32,
    p_current_query: u32,
    p_parent_query: u32,
    p_depth: u16,
    /// Nanoseconds per timestamp tick.
    p_timestamp_period: f32,
    p_timestamps: Vec<Timestamp>,
    p_data: Vec<u64>,
}

impl Profiler {
    pub fn new(queries_per_frame: u32, max_frames: u32, timestamp_period: f32) -> Self {
        Self {
            p_queries_per_frame: queries_per_frame,
            p_max_frames: max_frames,
            p_current_query: 0,
            p_parent_query: 0,
            p_depth: 0,
            p_timestamp_period: timestamp_period,
            p_timestamps: vec![
                Timestamp::default();
                (queries_per_frame * max_frames) as usize
            ],
            p_data: vec![0u64; (queries_per_frame * max_frames * 2) as usize],
        }
    }

    pub fn queries_per_frame(&self) -> u32 {
        self.p_queries_per_frame
    }

    /// Open a scope. Returns the query index the start timestamp
    /// must be written to.
    pub fn push_timestamp(&mut self, frame: u32, name: &'static str) -> u32 {
        let query_index = frame * self.p_queries_per_frame + self.p_current_query;

        let timestamp = &mut self.p_timestamps[query_index as usize];
        timestamp.start = query_index * 2;
        timestamp.end = timestamp.start + 1;
        timestamp.parent = self.p_parent_query as u16;
        timestamp.depth = self.p_depth;
        timestamp.name = name;
        self.p_depth += 1;

        self.p_parent_query = self.p_current_query;
        self.p_current_query += 1;

        timestamp.start
    }

    /// Close the innermost scope. Returns the query index for the
    /// end timestamp.
    pub fn pop_timestamp(&mut self, frame: u32) -> u32 {
        debug_assert!(self.p_depth > 0, "pop without a matching push");

        let query_index = frame * self.p_queries_per_frame + self.p_parent_query;
        let timestamp = self.p_timestamps[query_index as usize];

        self.p_parent_query = timestamp.parent as u32;
        self.p_depth -= 1;

        timestamp.end
    }

    /// The frame's scopes are complete and balanced.
    pub fn has_timestamps(&self) -> bool {
        self.p_current_query > 0 && self.p_depth == 0
    }

    pub fn current_queries(&self) -> u32 {
        self.p_current_query
    }

    pub fn reset_timestamps(&mut self) {
        self.p_current_query = 0;
        self.p_parent_query = 0;
        self.p_depth = 0;
    }

    /// Read this frame slot's query results back and resolve elapsed
    /// times. Call after the frame's fence has been waited on.
    pub fn fetch_data_from_gpu(
        &mut self,
        dev: &ash::Device,
        query_pool: vk::QueryPool,
        frame: u32,
        absolute_frame: u64,
    ) {
        if !self.has_timestamps() {
            return;
        }

        let query_offset = frame * self.p_queries_per_frame * 2;
        let query_count = self.p_current_query * 2;
        let data_range =
            &mut self.p_data[query_offset as usize..(query_offset + query_count) as usize];

        let result = unsafe {
            dev.get_query_pool_results(
                query_pool,
                query_offset,
                query_count,
                data_range,
                vk::QueryResultFlags::TYPE_64 | vk::QueryResultFlags::WAIT,
            )
        };
        if result.is_err() {
            return;
        }

        for q in 0..self.p_current_query {
            let index = (frame * self.p_queries_per_frame + q) as usize;
            let start = self.p_data[index * 2] as f64;
            let end = self.p_data[index * 2 + 1] as f64;

            let timestamp = &mut self.p_timestamps[index];
            timestamp.elapsed_ms = (end - start) * self.p_timestamp_period as f64 * 1e-6;
            timestamp.frame = absolute_frame;
        }
    }

    /// Resolved scopes for a frame slot, in push order.
    pub fn results(&self, frame: u32) -> Vec<TimestampResult> {
        let base = (frame * self.p_queries_per_frame) as usize;
        self.p_timestamps[base..base + self.p_queries_per_frame as usize]
            .iter()
            .take_while(|t| !t.name.is_empty())
            .map(|t| TimestampResult {
                name: t.name,
                depth: t.depth,
                elapsed_ms: t.elapsed_ms,
                frame: t.frame,
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn balanced_scopes_close_the_tree() {
        let mut profiler = Profiler::new(32, 2, 1.0);
        assert!(!profiler.has_timestamps());

        let outer_start = profiler.push_timestamp(0, "frame");
        let inner_start = profiler.push_timestamp(0, "gbuffer");
        let inner_end = profiler.pop_timestamp(0);
        let outer_end = profiler.pop_timestamp(0);

        assert!(profiler.has_timestamps());
        assert_eq!(outer_start, 0);
        assert_eq!(outer_end, 1);
        assert_eq!(inner_start, 2);
        assert_eq!(inner_end, 3);
        assert!(inner_end > inner_start);
        assert!(outer_end > outer_start);
    }

    #[test]
    fn unbalanced_tree_reports_no_timestamps() {
        let mut profiler = Profiler::new(32, 2, 1.0);
        profiler.push_timestamp(0, "open");
        assert!(!profiler.has_timestamps());
        profiler.pop_timestamp(0);
        assert!(profiler.has_timestamps());
    }

    #[test]
    fn nesting_depth_is_recorded() {
        let mut profiler = Profiler::new(32, 2, 1.0);
        profiler.push_timestamp(0, "a");
        profiler.push_timestamp(0, "b");
        profiler.push_timestamp(0, "c");
        profiler.pop_timestamp(0);
        profiler.pop_timestamp(0);
        profiler.pop_timestamp(0);

        let results = profiler.results(0);
        assert_eq!(results.len(), 3);
        assert_eq!(results[0].depth, 0);
        assert_eq!(results[1].depth, 1);
        assert_eq!(results[2].depth, 2);
    }

    #[test]
    fn sibling_scopes_share_a_parent() {
        let mut profiler = Profiler::new(32, 2, 1.0);
        profiler.push_timestamp(0, "root");
        profiler.push_timestamp(0, "left");
        profiler.pop_timestamp(0);
        profiler.push_timestamp(0, "right");
        profiler.pop_timestamp(0);
        let end = profiler.pop_timestamp(0);

        assert_eq!(end, 1);
        assert!(profiler.has_timestamps());
        assert_eq!(profiler.current_queries(), 3);
    }

    #[test]
    fn second_frame_uses_its_own_query_range() {
        let mut profiler = Profiler::new(32, 2, 1.0);
        profiler.push_timestamp(0, "f0");
        profiler.pop_timestamp(0);
        profiler.reset_timestamps();

        let start = profiler.push_timestamp(1, "f1");
        assert_eq!(start, 32 * 2);
    }
}
