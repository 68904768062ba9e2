use crate::Map;
use crate::manager::common::format_duration;
use std::time::Duration;

/// Format a duration as a SLURM time string, e.g. 01:05:02
pub fn format_slurm_duration(duration: &Duration) -> String {
    format_duration(duration)
}

pub fn parse_slurm_datetime(datetime: &str) -> anyhow::Result<chrono::NaiveDateTime> {
    Ok(chrono::NaiveDateTime::parse_from_str(
        datetime,
        "%Y-%m-%dT%H:%M:%S",
    )?)
}

/// Parse <key>=<value> pairs from the output of `scontrol show job <job-id>`.
pub fn get_scontrol_items(output: &str) -> Map<&str, &str> {
    let mut map = Map::new();
    for line in output.lines() {
        for item in line.trim().split(' ') {
            let iter: Vec<_> = item.split('=').take(2).collect();
            if iter.len() < 2 {
                continue;
            }
            let (key, value) = (iter[0], iter[1]);
            map.insert(key, value);
        }
    }
    map
}

#[cfg(test)]
mod test {
    use crate::manager::slurm::{get_scontrol_items, parse_slurm_datetime};

    #[test]
    fn test_parse_slurm_datetime() {
        let date = parse_slurm_datetime("2021-09-29T09:36:56").unwrap();
        assert_eq!(
            date.format("%d.%m.%Y %H:%M:%S").to_string(),
            "29.09.2021 09:36:56"
        );
    }

    #[test]
    fn test_get_scontrol_items() {
        let output = "JobId=4641914 JobName=worker
   JobState=RUNNING Reason=None Dependency=(null)
   StartTime=2021-10-07T11:15:26 EndTime=2021-10-07T11:30:26 Deadline=N/A";
        let items = get_scontrol_items(output);
        assert_eq!(items["JobId"], "4641914");
        assert_eq!(items["JobState"], "RUNNING");
        assert_eq!(items["StartTime"], "2021-10-07T11:15:26");
        assert_eq!(items["EndTime"], "2021-10-07T11:30:26");
    }
}
