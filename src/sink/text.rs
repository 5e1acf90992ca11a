/*
 * Text Log
 *
 * Renders the event stream as an aligned, human-readable text file, plus a
 * JSON-ish rendering of the end-of-run statistics. Field widths and the
 * time precision are configurable so hierarchies of different depths line
 * up.
 */

use std::io::Write;

use crate::sink::{CpuView, EventSink, SwitchTarget};
use crate::threads::{CoreStats, ThreadStatsMap, ThreadStatsReport};
use crate::time::Time;

/// Column alignment for the text log.
#[derive(Debug, Clone, Copy, Default)]
pub struct Align {
    pub cpu: usize,
    pub time: usize,
    pub module: usize,
    pub thread: usize,
}

pub struct TextLog<W: Write> {
    stream: W,
    align: Align,
    time_precision: usize,
}

impl<W: Write> TextLog<W> {
    pub fn new(stream: W, align: Align, time_precision: usize) -> TextLog<W> {
        let mut align = align;
        // the +1 is for the decimal separator
        align.time += time_precision + 1;
        TextLog {
            stream,
            align,
            time_precision,
        }
    }

    pub fn into_inner(self) -> W {
        self.stream
    }

    fn timespan(&self, span: Time) -> String {
        let span = span.to_f64();
        let plural = if span == 1.0 { "" } else { "s" };
        format!("{span:.prec$} unit{plural}", prec = self.time_precision)
    }

    /// "cpu N @ T: " prefix carried by pretty much every message.
    fn ct(&self, cpu: &CpuView) -> String {
        format!(
            "cpu {:>cpu_align$} @ {:>time_align$.prec$}: ",
            cpu.uid,
            cpu.current_time.to_f64(),
            cpu_align = self.align.cpu,
            time_align = self.align.time,
            prec = self.time_precision,
        )
    }

    /// Prefix plus the current thread.
    fn ctt(&self, cpu: &CpuView) -> String {
        let top = cpu.chain.top();
        let module = cpu.module_name(top);
        let align = (self.align.thread + self.align.module).saturating_sub(module.len());
        format!(
            "{}thread {}|{:<align$} ",
            self.ct(cpu),
            module,
            cpu.tid(top),
        )
    }

    /// Prefix plus a module (the top's by default, a frame's otherwise).
    fn ctm(&self, cpu: &CpuView, frame: Option<usize>) -> String {
        let thread = match frame {
            Some(idx) => cpu.chain.thread_at(idx),
            None => cpu.chain.top(),
        };
        // aligned with ctt output
        let align = self.align.module + self.align.thread + 1;
        format!(
            "{}module {:<align$} ",
            self.ct(cpu),
            cpu.module_name(thread),
        )
    }
}

impl<W: Write> EventSink for TextLog<W> {
    fn init_core(&mut self, _cpu: &CpuView) {}

    fn context_switch(&mut self, cpu: &CpuView, target: &SwitchTarget, cost: Time) {
        let top = cpu.chain.top();

        if let SwitchTarget::Append(appendix) = target
            && cpu.module_of(appendix.bottom()) == cpu.module_of(top)
        {
            let line = format!(
                "{}selects {}.",
                self.ctm(cpu, None),
                cpu.tid(appendix.bottom())
            );
            let _ = writeln!(self.stream, "{line}");
        }

        let thread_to = match target {
            SwitchTarget::Append(appendix) => appendix.top(),
            SwitchTarget::Split(idx) => cpu.chain.thread_at(*idx),
        };

        let destination = if cpu.module_of(thread_to) == cpu.module_of(top) {
            format!("thread {}", cpu.tid(thread_to))
        } else {
            format!("module {}", cpu.module_name(thread_to))
        };

        let switch = if cost.is_zero() {
            format!("switches to {destination}")
        } else {
            format!("spends {} to switch to {destination}", self.timespan(cost))
        };
        let line = format!("{}{}.", self.ctm(cpu, None), switch);
        let _ = writeln!(self.stream, "{line}");
    }

    fn thread_execute(&mut self, cpu: &CpuView, runtime: Time) {
        let line = format!("{}runs for {}.", self.ctt(cpu), self.timespan(runtime));
        let _ = writeln!(self.stream, "{line}");
    }

    fn thread_yield(&mut self, cpu: &CpuView) {
        let line = format!("{}yields.", self.ctt(cpu));
        let _ = writeln!(self.stream, "{line}");
    }

    fn cpu_idle(&mut self, cpu: &CpuView, idle_time: Time) {
        let line = format!("{}idle for {}.", self.ct(cpu), self.timespan(idle_time));
        let _ = writeln!(self.stream, "{line}");
    }

    fn timer_interrupt(&mut self, cpu: &CpuView, idx: usize, delay: Time) {
        let mut line = format!("{}timer elapsed", self.ctm(cpu, Some(idx)));
        if !delay.is_zero() {
            line.push_str(&format!(" ({} delay)", self.timespan(delay)));
        }
        let _ = writeln!(self.stream, "{line}.");
    }

    fn thread_statistics(&mut self, stats: &ThreadStatsMap) {
        let _ = writeln!(self.stream, "Thread stats:\n{}", stats_map_json(stats, "\n"));
    }

    fn cpu_statistics(&mut self, stats: &[CoreStats]) {
        let _ = writeln!(self.stream, "Core stats:");
        for (core, stat) in stats.iter().enumerate() {
            let _ = writeln!(self.stream, "Core {core}");
            let _ = writeln!(self.stream, "\tcrunch_time: {}", intify(stat.crunch_time));
            let _ = writeln!(self.stream, "\tidle_time: {}", intify(stat.idle_time));
            let _ = writeln!(self.stream, "\tmodule_time: {}", intify(stat.module_time));
            let _ = writeln!(self.stream, "\tthread_time: {}", intify(stat.thread_time));
            let _ = writeln!(self.stream, "\ttimer_delay: {}", intify(stat.timer_delay));
        }
    }
}

/// Integer rendering when the value is whole, fractional otherwise.
fn intify(value: Time) -> String {
    if value.denom() == 1 {
        value.numer().to_string()
    } else {
        format!("{}", value.to_f64())
    }
}

fn opt_json(value: Option<Time>) -> String {
    match value {
        Some(value) => intify(value),
        None => "null".into(),
    }
}

fn list_json(values: &[Time]) -> String {
    let items: Vec<String> = values.iter().map(|&v| intify(v)).collect();
    format!("[{}]", items.join(", "))
}

fn nested_list_json(values: &[Vec<Time>]) -> String {
    let items: Vec<String> = values.iter().map(|v| list_json(v)).collect();
    format!("[{}]", items.join(", "))
}

fn stats_map_json(stats: &ThreadStatsMap, sep_indent: &str) -> String {
    let next = format!("{sep_indent}\t");
    let entries: Vec<String> = stats
        .iter()
        .map(|((module, tid), report)| {
            format!("\"{module}|{tid}\": {}", report_json(report, &next))
        })
        .collect();
    format!(
        "{{{next}{}{sep_indent}}}",
        entries.join(&format!(",{next}"))
    )
}

/// Fields in alphabetical order, absent optional sections skipped.
fn report_json(report: &ThreadStatsReport, sep_indent: &str) -> String {
    let next = format!("{sep_indent}\t");
    let mut fields: Vec<(&str, String)> = Vec::new();
    if let Some(bg) = &report.bg {
        fields.push(("bg", nested_list_json(bg)));
    }
    if let Some(children) = &report.children {
        fields.push(("children", stats_map_json(children, &next)));
    }
    fields.push(("ctxsw", list_json(&report.ctxsw)));
    fields.push(("finished_time", opt_json(report.finished_time)));
    fields.push(("remaining", opt_json(report.remaining)));
    fields.push(("response_time", opt_json(report.response_time)));
    fields.push(("run", nested_list_json(&report.run)));
    if let Some(scheduler) = &report.scheduler {
        fields.push(("scheduler", stats_map_json(scheduler, &next)));
    }
    fields.push(("total_run", intify(report.total_run)));
    fields.push(("wait", nested_list_json(&report.wait)));
    if let Some(waiting) = report.waiting {
        fields.push(("waiting", intify(waiting)));
    }

    let entries: Vec<String> = fields
        .into_iter()
        .map(|(key, value)| format!("\"{key}\": {value}"))
        .collect();
    format!("{{{next}{}{sep_indent}}}", entries.join(&format!(",{next}")))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_intify() {
        assert_eq!(intify(Time::from_integer(10)), "10");
        assert_eq!(intify(Time::new(5, 2)), "2.5");
    }

    #[test]
    fn test_report_json_shape() {
        let report = ThreadStatsReport {
            finished_time: Some(Time::from_integer(25)),
            response_time: None,
            ctxsw: vec![Time::zero()],
            run: vec![vec![Time::from_integer(10)]],
            total_run: Time::from_integer(10),
            wait: vec![vec![]],
            waiting: None,
            remaining: Some(Time::zero()),
            bg: None,
            children: None,
            scheduler: None,
        };
        let json = report_json(&report, "\n");
        assert!(json.contains("\"finished_time\": 25"));
        assert!(json.contains("\"response_time\": null"));
        assert!(!json.contains("\"bg\""));
    }
}
