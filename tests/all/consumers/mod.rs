mod aggregation;
mod delivery_consumer;
