use arrow::datatypes::{DataType, Field, Schema};

pub fn raw_data_schema() -> Schema {
    Schema::new(vec![
        Field::new("ip", DataType::Int64, false),
        Field::new("port", DataType::Int64, false),
        Field::new("fetchTime", DataType::Int64, false),
        Field::new("result", DataType::Int64, false),
        Field::new("response", DataType::Binary, false),
    ])
}

pub fn certificates_schema() -> Schema {
    Schema::new(vec![
        Field::new("KeyType", DataType::Int64, false),
        Field::new("BitLen", DataType::Int64, false),
        Field::new("Data", DataType::Binary, false),
    ])
}
