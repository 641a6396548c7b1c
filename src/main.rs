#![allow(dead_code)]

mod address;
mod block_manager;
mod config;
mod device;
mod event;
mod ftl;
mod sim;

use byte_unit::Byte;
use log::info;
use simplelog::{ConfigBuilder, LevelFilter, SimpleLogger};
use time::macros::format_description;

use crate::config::{Config, Time, PAGE_SIZE};
use crate::sim::Simulation;

fn main() {
    let log_cfg = ConfigBuilder::new()
        .set_time_format_custom(format_description!("[hour]:[minute]:[second].[subsecond]"))
        .build();
    SimpleLogger::init(LevelFilter::Debug, log_cfg).unwrap();

    let cfg = Config::default();
    info!(
        "physical capacity: {} bytes, {}",
        cfg.total_pages() * PAGE_SIZE,
        Byte::from(cfg.total_pages() * PAGE_SIZE).get_appropriate_unit(true)
    );

    let mut sim = Simulation::new(cfg.clone()).expect("device geometry is invalid");

    // Sequentially fill a quarter of the device, then rewrite the first half
    // of that range to exercise switches, merges and reclamation.
    let span = cfg.total_pages() / 4;
    let mut t: Time = 0.0;
    for lba in 0..span {
        sim.submit_write(lba, t);
        t += cfg.page_write_delay;
    }
    for lba in 0..span / 2 {
        sim.submit_write(lba, t);
        t += cfg.page_write_delay;
    }
    sim.run();

    info!(
        "workload done at t={:.0}: {} events, {} erases, {} failed writes, {} failed reads",
        sim.now(),
        sim.completed(),
        sim.erases(),
        sim.failed_writes(),
        sim.failed_reads()
    );
    info!(
        "free pages {} of {}, reservable for new writes {}",
        sim.bm.num_free_pages(),
        cfg.total_pages(),
        sim.bm.num_available_pages_for_new_writes()
    );
}
