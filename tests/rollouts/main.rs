mod claim_scenarios;
mod controller_e2e;
mod index_fanout;
mod queue_dedup;
mod rollout_scenarios;
