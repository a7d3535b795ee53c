use chrono::{DateTime, Duration, TimeZone, Utc};
use cron::Schedule;
use std::str::FromStr;
use tracing::debug;

use chaos_core::{OrchestratorError, OrchestratorResult};
use chaos_domain::ScheduleSpec;

/// CRON表达式解析和调度工具
pub struct CronScheduler {
    schedule: Schedule,
}

impl CronScheduler {
    /// 创建新的CRON调度器
    pub fn new(cron_expr: &str) -> OrchestratorResult<Self> {
        let schedule =
            Schedule::from_str(cron_expr).map_err(|e| OrchestratorError::InvalidCron {
                expr: cron_expr.to_string(),
                message: e.to_string(),
            })?;

        Ok(Self { schedule })
    }

    /// 获取下一次执行时间
    pub fn next_execution_time(&self, from: DateTime<Utc>) -> Option<DateTime<Utc>> {
        self.schedule.after(&from).next()
    }

    /// 获取从指定时间开始的多个执行时间
    pub fn upcoming_times(&self, from: DateTime<Utc>, count: usize) -> Vec<DateTime<Utc>> {
        self.schedule.after(&from).take(count).collect()
    }

    /// 检查调度是否错过了执行时间（超过宽限期仍未运行）
    pub fn is_task_overdue(
        &self,
        last_run: DateTime<Utc>,
        now: DateTime<Utc>,
        grace_period_minutes: i64,
    ) -> bool {
        match self.schedule.after(&last_run).next() {
            Some(expected_time) => now > expected_time + Duration::minutes(grace_period_minutes),
            None => false,
        }
    }

    /// 获取调度的执行频率描述
    pub fn get_frequency_description(&self) -> String {
        let upcoming = self.upcoming_times(Utc::now(), 2);
        if upcoming.len() >= 2 {
            let seconds = (upcoming[1] - upcoming[0]).num_seconds();
            match seconds {
                s if s < 60 => format!("每{s}秒"),
                s if s < 3600 => format!("每{}分钟", s / 60),
                s if s < 86400 => format!("每{}小时", s / 3600),
                s if s < 604800 => format!("每{}天", s / 86400),
                s => format!("每{}周", s / 604800),
            }
        } else {
            "无法确定频率".to_string()
        }
    }
}

/// 调度规格的下一次运行时间
///
/// 一次性调度只运行一次，已经有过运行记录时返回 None。
pub fn next_fire_time(
    spec: &ScheduleSpec,
    has_run: bool,
    now: DateTime<Utc>,
) -> OrchestratorResult<Option<DateTime<Utc>>> {
    spec.validate()?;
    if let Some(expr) = &spec.cron_expression {
        let scheduler = CronScheduler::new(expr)?;
        debug!("CRON调度 {} 的执行频率: {}", expr, scheduler.get_frequency_description());
        return Ok(scheduler.next_execution_time(now));
    }
    if has_run {
        return Ok(None);
    }
    match spec.time_in_milliseconds {
        Some(millis) => Utc
            .timestamp_millis_opt(millis)
            .single()
            .map(Some)
            .ok_or_else(|| OrchestratorError::validation(format!("无效的调度时间: {millis}"))),
        None => Ok(None),
    }
}
