use crate::Map;
use crate::manager::common::format_duration;
use std::time::Duration;

/// Format a duration as an SGE `h_rt` time string, e.g. 01:05:02
pub fn format_sge_duration(duration: &Duration) -> String {
    format_duration(duration)
}

/// Parse the text table printed by `qstat`.
///
/// Returns the state tokens reported for each job id. An array job can appear
/// on several rows (one per task range or queue instance), hence the `Vec`.
pub fn parse_qstat_table(output: &str) -> Map<&str, Vec<&str>> {
    let mut jobs: Map<&str, Vec<&str>> = Map::new();
    for line in output
        .lines()
        .skip_while(|line| !line.starts_with('-'))
        .skip(1)
    {
        let mut items = line.split_whitespace();
        let (Some(job_id), Some(state)) = (items.next(), items.nth(3)) else {
            continue;
        };
        jobs.entry(job_id).or_default().push(state);
    }
    jobs
}

#[cfg(test)]
mod test {
    use crate::manager::sge::parse_qstat_table;

    #[test]
    fn test_parse_qstat_table() {
        let output = r#"job-ID  prior   name       user         state submit/start at     queue                          slots ja-task-ID
-----------------------------------------------------------------------------------------------------------------
    181 0.55500 worker     jdoe         r     08/06/2026 10:01:02 all.q@node01                       1 1
    182 0.00000 worker     jdoe         qw    08/06/2026 10:01:10                                    1 1-4:1
    182 0.00000 worker     jdoe         r     08/06/2026 10:01:12 all.q@node02                       1 5
"#;
        let jobs = parse_qstat_table(output);
        assert_eq!(jobs.len(), 2);
        assert_eq!(jobs["181"], vec!["r"]);
        assert_eq!(jobs["182"], vec!["qw", "r"]);
    }

    #[test]
    fn test_parse_qstat_table_empty() {
        assert!(parse_qstat_table("").is_empty());
    }
}
